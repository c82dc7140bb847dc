//! Petrel - high-rate stateless single-packet network scanner engine.
//!
//! Enumerates an address x port target space through a cyclic-group
//! permutation (no target list, no visited set), transmits one probe per
//! target at a precisely rate-limited pace, and validates responses with
//! a keyed function recomputed from packet fields alone - no per-probe
//! state anywhere. Usable as a library or via the CLI.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod cyclic;
pub mod engine;
pub mod monitor;
pub mod output;
pub mod probe;
pub mod recv;
pub mod send;
pub mod shard;
pub mod targets;
pub mod transport;

// Re-export the types embedders touch most.
pub use config::{MacAddr, OutputFormat, RuntimeState, ScanConfig};
pub use crypto::{Validation, Validator};
pub use cyclic::Cycle;
pub use engine::{bandwidth_to_rate, ConfigError, ScanError, Scanner};
pub use output::{CsvEncoder, FieldDef, FieldSet, JsonEncoder, OutputSink, Value};
pub use probe::{create_module, ProbeModule, MODULE_NAMES};
pub use shard::{Shard, Target, TargetSpace};
pub use targets::{AddressOracle, CidrOracle, PortList, SourcePool};
pub use transport::{
    Batch, BatchSender, Captured, MockBatchSender, MockCapture, PacketCapture, TransportFactory,
};
