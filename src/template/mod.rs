//! Template string resolution
//!
//! Configuration values may embed `${path.to.key}` references which are
//! resolved against a layered context (project fields, variables, provider
//! outputs, module versions, runtime outputs). Resolution happens in two
//! passes: a static pass during config load, where `runtime.*` references are
//! deferred verbatim, and a runtime pass just before a handler invocation,
//! where everything must resolve.

mod context;
mod parser;
mod resolver;

pub use context::TemplateContext;
pub use parser::{parse_template, Segment, Template};
pub use resolver::{collect_references, resolve_config, resolve_string, Resolution, TemplatePass};
