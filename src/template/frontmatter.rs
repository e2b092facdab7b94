//! Template frontmatter: the YAML header describing where rendered
//! output goes and how it is injected.

use gray_matter::engine::YAML;
use gray_matter::Matter;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::AnchorSpec;

/// A template file split into its raw frontmatter and body. The
/// frontmatter is rendered before parsing so `to:` may interpolate
/// variables.
#[derive(Debug, Clone)]
pub struct TemplateFile {
    pub frontmatter_raw: String,
    pub body: String,
}

pub fn split(content: &str) -> TemplateFile {
    let matter = Matter::<YAML>::new();
    let parsed: gray_matter::Result<gray_matter::ParsedEntity> = matter.parse(content);

    // gray_matter decides whether a frontmatter block is present; the
    // raw YAML text and the byte-exact body are re-extracted from the
    // source, since the YAML must be rendered before parsing and the
    // body must reproduce exactly.
    if parsed.is_ok_and(|p| p.data.is_some()) {
        if let Some((frontmatter_raw, body)) = split_fenced(content) {
            return TemplateFile {
                frontmatter_raw,
                body,
            };
        }
    }
    TemplateFile {
        frontmatter_raw: String::new(),
        body: content.to_string(),
    }
}

fn split_fenced(content: &str) -> Option<(String, String)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))?;
    let end = rest.find("\n---")?;
    let raw = rest[..end].to_string();
    let after = &rest[end + "\n---".len()..];
    let body = after
        .strip_prefix("\r\n")
        .or_else(|| after.strip_prefix('\n'))
        .unwrap_or(after);
    Some((raw, body.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Frontmatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub inject: bool,
    #[serde(flatten)]
    pub anchor: AnchorSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
    #[serde(default)]
    pub unless_exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Parse rendered frontmatter text.
pub fn parse(rendered: &str) -> Result<Frontmatter> {
    if rendered.trim().is_empty() {
        return Ok(Frontmatter::default());
    }
    serde_yaml::from_str(rendered).map_err(|e| {
        EngineError::new(
            ErrorCode::TemplateRenderFailed,
            format!("invalid template frontmatter: {e}"),
        )
        .with_source(e)
    })
}

impl Frontmatter {
    /// Injection requires exactly one anchor strategy; creation must not
    /// carry anchors.
    pub fn validate(&self) -> Result<()> {
        if self.inject {
            match self.anchor.strategy_count() {
                1 => Ok(()),
                0 => Err(EngineError::new(
                    ErrorCode::TemplateRenderFailed,
                    "inject: true requires one of after, before, at, or atLine",
                )),
                _ => Err(EngineError::new(
                    ErrorCode::TemplateRenderFailed,
                    "inject accepts exactly one of after, before, at, or atLine",
                )),
            }
        } else if !self.anchor.is_empty() {
            Err(EngineError::new(
                ErrorCode::TemplateRenderFailed,
                "after/before/at/atLine are only valid with inject: true",
            ))
        } else {
            Ok(())
        }
    }
}
