use anyhow::{Context, Result};
use handlebars::Handlebars;

/// HTML pages served by the admin interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Inbox,
}

impl Page {
    pub const ALL: [Page; 1] = [Page::Inbox];

    pub fn name(self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Self::Inbox => include_str!("template/index.hbs"),
        }
    }
}

/// Builds the registry with every page registered.
///
/// Rendering is strict: a page referring to a field its context lacks fails instead of printing
/// nothing.
pub fn new() -> Result<Handlebars<'static>> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);

    for page in Page::ALL {
        registry
            .register_template_string(page.name(), page.source())
            .with_context(|| format!("could not compile the {} page template", page.name()))?;
    }

    Ok(registry)
}
