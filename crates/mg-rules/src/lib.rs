//! Build rules for driving the Qt code generators — the meta-object
//! compiler (`moc`), the resource compiler (`rcc`) and the UI-form
//! compiler (`uic`) — with correct incremental rebuild behavior.
//!
//! Two rule shapes do all the work:
//!
//! * [`CompileRule`] — one input file, one generator run, one output,
//!   with a per-output ledger tracking the rule version, tool checksum,
//!   option hash, input path and (for `moc`) the auxiliary files the
//!   generator itself reported consulting.
//! * [`AutomocRule`] — an aggregate that owns a set of headers and
//!   sources, scans them for meta-object markers, synthesizes one
//!   compile target per positive match during the match phase, and
//!   delegates the actual generation to the `moc` compile rule.

pub mod automoc;
pub mod compile;
pub mod depfile;
pub mod options;
pub mod tool;

use std::sync::Arc;

pub use automoc::{AutomocRule, AUTOMOC_RULE_ID};
pub use compile::{CompileRule, Generator};
pub use tool::Tool;

use mg_engine::Rule;

/// The standard rule registry: the aggregate discovery rule first (it
/// claims automoc groups), then the three compile rules.
pub fn rules(moc: Tool, rcc: Tool, uic: Tool) -> (Arc<AutomocRule>, Vec<Arc<dyn Rule>>) {
    let automoc = Arc::new(AutomocRule::new());
    let registry: Vec<Arc<dyn Rule>> = vec![
        automoc.clone(),
        Arc::new(CompileRule::new(Generator::Moc, moc)),
        Arc::new(CompileRule::new(Generator::Rcc, rcc)),
        Arc::new(CompileRule::new(Generator::Uic, uic)),
    ];
    (automoc, registry)
}
