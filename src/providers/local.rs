//! Offline placeholder image, used when no hosted provider produced one.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::Artifact;

/// Name reported for placeholder artifacts.
pub const PLACEHOLDER_NAME: &str = "demo";

/// Characters of the prompt shown in the placeholder caption.
pub const CAPTION_CHARS: usize = 60;

/// Renders a gradient SVG captioned with the start of the prompt.
///
/// Pure and synchronous; never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPlaceholder;

impl LocalPlaceholder {
    /// Build the placeholder for `prompt` as an SVG data URI.
    pub fn render(&self, prompt: &str) -> Artifact {
        let caption: String = prompt.chars().take(CAPTION_CHARS).collect();
        let svg = format!(
            r#"<svg width="512" height="512" xmlns="http://www.w3.org/2000/svg">
  <defs>
    <linearGradient id="grad1" x1="0%" y1="0%" x2="100%" y2="100%">
      <stop offset="0%" style="stop-color:rgb(138,43,226);stop-opacity:1" />
      <stop offset="50%" style="stop-color:rgb(75,0,130);stop-opacity:1" />
      <stop offset="100%" style="stop-color:rgb(25,25,112);stop-opacity:1" />
    </linearGradient>
  </defs>
  <rect width="512" height="512" fill="url(#grad1)"/>
  <text x="256" y="200" font-family="Arial" font-size="24" fill="white" text-anchor="middle">Dream Image</text>
  <text x="256" y="240" font-family="Arial" font-size="16" fill="white" text-anchor="middle" opacity="0.8">Generated from EEG Analysis</text>
  <text x="256" y="300" font-family="Arial" font-size="12" fill="white" text-anchor="middle" opacity="0.6">{}...</text>
  <circle cx="256" cy="380" r="40" fill="none" stroke="white" stroke-width="2" opacity="0.5"/>
  <circle cx="256" cy="380" r="30" fill="none" stroke="white" stroke-width="2" opacity="0.7"/>
  <circle cx="256" cy="380" r="20" fill="white" opacity="0.3"/>
</svg>"#,
            escape_xml(&caption)
        );
        Artifact::DataUri(format!(
            "data:image/svg+xml;base64,{}",
            STANDARD.encode(svg.as_bytes())
        ))
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
