pub mod acf;
pub mod codec;
pub mod config;
pub mod conn;
pub mod decode;
pub mod error;
pub mod frame;
pub mod integrate;
pub mod iqbuf;
pub mod opcode;
pub mod protocol;
pub mod publish;
pub mod scan;
pub mod seq;
pub mod seqlog;
pub mod shutdown;
pub mod site;
pub mod timing;

#[cfg(test)]
mod testutil;

pub use acf::{AcfEngine, IntegrationAccumulator, LagTable, StandardAcf};
pub use config::{ConfigError, ScanConfig, SiteConfig};
pub use conn::{ConnError, Connection};
pub use error::WireError;
pub use integrate::{BeamRequest, IntegrationOptions, Integrator};
pub use iqbuf::IqBuffer;
pub use opcode::Opcode;
pub use protocol::Request;
pub use scan::{BeamScanPlan, Scanner};
pub use shutdown::{Cancelled, Checkpoint};
pub use site::{Site, SiteError};
pub use timing::{TimingSequence, TimingSequenceParameters};
