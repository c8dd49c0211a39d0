pub mod calculation;
pub mod debate;
pub mod divergence;
pub mod extraction;
pub mod quality;
pub mod records;
pub mod synthesis;

pub use debate::{resolve_case, Arbiter, ArbiterPolicy, DebateOutcome, DefenseSource};
pub use extraction::{extract_record, parse_with_repair, HeuristicRepair, Repair};
pub use records::*;
pub use synthesis::{synthesize, SynthesisReport, Upstream};
