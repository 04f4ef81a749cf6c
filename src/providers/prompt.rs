//! Image prompt and interpretation built from a classification.
//!
//! Each band's share of total power picks one of three phrase tiers:
//! above 0.3 is high, above 0.2 moderate, otherwise low.

use serde::{Deserialize, Serialize};

use crate::compute::BandPowers;

const HIGH: f64 = 0.3;
const MODERATE: f64 = 0.2;

/// Prompt for an image provider plus a readable interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DreamPrompt {
    /// Text sent to the image provider.
    pub prompt: String,
    /// Explanation shown to the user.
    pub interpretation: String,
}

struct Tier {
    elements: &'static str,
    description: &'static str,
}

fn tier(share: f64, high: Tier, moderate: Tier, low: Tier) -> Tier {
    if share > HIGH {
        high
    } else if share > MODERATE {
        moderate
    } else {
        low
    }
}

fn base_scene(dream_type: &str) -> &'static str {
    match dream_type {
        "Lucid Dream" => "a surreal lucid dreamscape with impossible geometry and vivid colors",
        "Nightmare" => "a dark, unsettling nightmare scene with ominous shadows",
        "Memory Recall" => "a nostalgic memory scene with soft, faded colors",
        "Normal Sleep" => "a peaceful, abstract dream environment",
        _ => "an abstract dreamscape",
    }
}

impl DreamPrompt {
    /// Build the prompt for `dream_type` at `confidence_pct` percent.
    ///
    /// Unknown dream types get a generic scene.
    pub fn build(dream_type: &str, confidence_pct: f64, bands: &BandPowers) -> Self {
        let shares = bands.shares();

        let depth = tier(
            shares.delta,
            Tier {
                elements: "deep underwater caverns, mysterious fog, ancient ruins",
                description: "High delta waves suggest deep unconscious processing",
            },
            Tier {
                elements: "misty valleys, hidden pathways",
                description: "Moderate delta waves indicate restful sleep state",
            },
            Tier {
                elements: "clear skies, open spaces",
                description: "Low delta waves suggest lighter sleep",
            },
        );
        let creative = tier(
            shares.theta,
            Tier {
                elements: "floating islands, morphing shapes, impossible architecture, melting clocks",
                description: "High theta waves indicate strong creative imagination",
            },
            Tier {
                elements: "unusual perspectives, dreamlike transitions",
                description: "Moderate theta waves show creative processing",
            },
            Tier {
                elements: "realistic forms, familiar structures",
                description: "Low theta waves suggest more literal dream content",
            },
        );
        let visual = tier(
            shares.alpha,
            Tier {
                elements: "vibrant colors, crystal clear details, luminous light, ethereal glow",
                description: "High alpha waves create vivid, clear visualizations",
            },
            Tier {
                elements: "soft colors, gentle lighting",
                description: "Moderate alpha waves provide balanced imagery",
            },
            Tier {
                elements: "muted tones, dim lighting, shadowy forms",
                description: "Low alpha waves result in less vivid imagery",
            },
        );
        let complexity = tier(
            shares.beta,
            Tier {
                elements: "intricate patterns, detailed textures, multiple layers, complex scenes",
                description: "High beta waves add mental complexity and detail",
            },
            Tier {
                elements: "moderate detail, balanced composition",
                description: "Moderate beta waves create structured dreams",
            },
            Tier {
                elements: "simple forms, minimal detail",
                description: "Low beta waves suggest relaxed, simple imagery",
            },
        );

        let prompt = format!(
            "{}, featuring {}, with {}, rendered in {}, showing {}, digital art, dreamlike, surreal, high quality, 4k",
            base_scene(dream_type),
            depth.elements,
            creative.elements,
            visual.elements,
            complexity.elements,
        );

        let interpretation = format!(
            "Dream Image Interpretation:\n\n\
             Brain Wave Analysis:\n\
             - Delta ({:.1}%): {}\n\
             - Theta ({:.1}%): {}\n\
             - Alpha ({:.1}%): {}\n\
             - Beta ({:.1}%): {}\n\n\
             Dream Type: {} (Confidence: {:.1}%)\n\n\
             This image represents the approximate visual characteristics of your dream \
             based on your brain wave patterns during sleep.",
            shares.delta * 100.0,
            depth.description,
            shares.theta * 100.0,
            creative.description,
            shares.alpha * 100.0,
            visual.description,
            shares.beta * 100.0,
            complexity.description,
            dream_type,
            confidence_pct,
        );

        Self {
            prompt,
            interpretation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bands(delta: f64, theta: f64, alpha: f64, beta: f64) -> BandPowers {
        BandPowers {
            delta,
            theta,
            alpha,
            beta,
        }
    }

    #[test]
    fn test_default_result_prompt() {
        let p = DreamPrompt::build("Lucid Dream", 85.7, &BandPowers::DEFAULT_RESULT);
        // shares: 0.21, 0.15, 0.36, 0.28
        assert!(p.prompt.starts_with("a surreal lucid dreamscape"));
        assert!(p.prompt.contains("misty valleys"));
        assert!(p.prompt.contains("realistic forms"));
        assert!(p.prompt.contains("vibrant colors"));
        assert!(p.prompt.contains("moderate detail"));
        assert!(p.interpretation.contains("Confidence: 85.7%"));
    }

    #[test]
    fn test_dominant_delta_selects_high_tier() {
        let p = DreamPrompt::build("Nightmare", 60.0, &bands(5.0, 1.0, 1.0, 1.0));
        assert!(p.prompt.contains("deep underwater caverns"));
        assert!(p.prompt.contains("simple forms"));
        assert!(p.interpretation.contains("Delta (62.5%)"));
    }

    #[test]
    fn test_zero_bands_use_equal_shares() {
        let p = DreamPrompt::build("Normal Sleep", 40.0, &bands(0.0, 0.0, 0.0, 0.0));
        assert!(p.prompt.contains("misty valleys"));
        assert!(p.interpretation.contains("Beta (25.0%)"));
    }

    #[test]
    fn test_unknown_type_uses_generic_scene() {
        let p = DreamPrompt::build("Daydream", 10.0, &BandPowers::DEFAULT_RESULT);
        assert!(p.prompt.starts_with("an abstract dreamscape"));
    }
}
