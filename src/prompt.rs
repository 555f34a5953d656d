//! Prompt templates.
//!
//! Prompts are Handlebars templates with a small, fixed set of bindings
//! describing the unit being analyzed. They can be loaded from TOML or JSON
//! files, or taken from one of the built-in [`OutputLevel`]s.

use clap::ValueEnum;
use handlebars::Handlebars;
use schemars::JsonSchema;

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// How much detail should the analysis contain?
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputLevel {
    /// A short summary for non-specialists.
    Executive,
    /// A complete technical extraction.
    #[default]
    Technical,
    /// Everything, including page-by-page breakdowns.
    Detailed,
}

/// A chat prompt template.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    #[serde(default)]
    pub developer: Option<String>,

    /// The user message. The page content is attached after this text.
    ///
    /// Available bindings: `document_name`, `page_label`, `first_page`,
    /// `last_page`, `total_pages`.
    pub user: String,
}

/// A prompt with all template values filled in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub developer: Option<String>,
    pub user: String,
}

/// Values available to prompt templates.
#[derive(Debug, Serialize)]
pub struct PromptBindings<'a> {
    pub document_name: &'a str,
    pub page_label: &'a str,
    pub first_page: usize,
    pub last_page: usize,
    pub total_pages: usize,
}

impl ChatPrompt {
    /// One of our built-in prompts.
    pub fn builtin(level: OutputLevel) -> Result<Self> {
        let source = match level {
            OutputLevel::Executive => include_str!("prompts/executive.toml"),
            OutputLevel::Technical => include_str!("prompts/technical.toml"),
            OutputLevel::Detailed => include_str!("prompts/detailed.toml"),
        };
        toml::from_str(source)
            .with_context(|| format!("failed to parse built-in {level:?} prompt"))
    }

    /// Load a prompt from a TOML or JSON file, and check that it renders.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let prompt: ChatPrompt = read_json_or_toml(path).await?;
        prompt
            .check()
            .with_context(|| format!("invalid prompt template in {}", path.display()))?;
        Ok(prompt)
    }

    /// Render against sample bindings, so that template mistakes are caught
    /// before we start spending money.
    pub fn check(&self) -> Result<()> {
        self.render(&PromptBindings {
            document_name: "example.pdf",
            page_label: "page 1",
            first_page: 1,
            last_page: 1,
            total_pages: 1,
        })
        .map(|_| ())
    }

    /// Fill in our templates.
    pub fn render(&self, bindings: &PromptBindings<'_>) -> Result<RenderedPrompt> {
        let handlebars = new_handlebars();
        let developer = self
            .developer
            .as_deref()
            .map(|developer| handlebars.render_template(developer, bindings))
            .transpose()
            .context("failed to render developer prompt")?;
        let user = handlebars
            .render_template(&self.user, bindings)
            .context("failed to render user prompt")?;
        Ok(RenderedPrompt { developer, user })
    }
}

/// Our prompts are plain text, not HTML, and unknown variables are
/// mistakes.
fn new_handlebars() -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars.set_strict_mode(true);
    handlebars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_prompts_parse_and_render() -> Result<()> {
        for level in OutputLevel::value_variants() {
            let prompt = ChatPrompt::builtin(*level)?;
            let rendered = prompt.render(&PromptBindings {
                document_name: "bracket.pdf",
                page_label: "chunk 2, pages 3-4",
                first_page: 3,
                last_page: 4,
                total_pages: 9,
            })?;
            assert!(rendered.user.contains("# chunk 2, pages 3-4"));
            assert!(rendered.user.contains("\"bracket.pdf\""));
            assert!(rendered.developer.is_some());
        }
        Ok(())
    }

    #[test]
    fn unknown_bindings_are_rejected() {
        let prompt = ChatPrompt {
            developer: None,
            user: "Look at {{pgae_label}}".to_owned(),
        };
        assert!(prompt.check().is_err());
    }

    #[test]
    fn rendering_does_not_html_escape() -> Result<()> {
        let prompt = ChatPrompt {
            developer: Some("Be <brief>.".to_owned()),
            user: "Read {{document_name}}".to_owned(),
        };
        let rendered = prompt.render(&PromptBindings {
            document_name: "a&b.pdf",
            page_label: "page 1",
            first_page: 1,
            last_page: 1,
            total_pages: 1,
        })?;
        assert_eq!(rendered.user, "Read a&b.pdf");
        assert_eq!(rendered.developer.as_deref(), Some("Be <brief>."));
        Ok(())
    }
}
