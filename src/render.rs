use crate::error::Result;
use crate::event::EventView;
use crate::hook::CompiledTemplates;
use crate::template::TemplateSet;

/// Concrete strings for one unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedUnit {
    /// Working directory; empty means the server's own.
    pub dir: String,
    /// `KEY=VALUE` entries; empty means inherit the server environment.
    pub env: Vec<String>,
    /// Argument lists, program first.
    pub commands: Vec<Vec<String>>,
}

/// Render directory, environment and commands, in that order. The first
/// failure discards everything rendered so far.
pub fn render_unit(templates: &CompiledTemplates, view: &EventView<'_>) -> Result<RenderedUnit> {
    let set = &templates.set;
    let data = TemplateSet::context(view)?;

    let dir = match &templates.dir {
        Some(id) => set.render_in(id, &data)?,
        None => String::new(),
    };

    let env = templates
        .env
        .iter()
        .map(|id| set.render_in(id, &data))
        .collect::<Result<Vec<_>>>()?;

    let commands = templates
        .commands
        .iter()
        .map(|args| {
            args.iter()
                .map(|id| set.render_in(id, &data))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RenderedUnit { dir, env, commands })
}
