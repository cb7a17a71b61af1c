pub mod error;
pub mod codec;
pub mod header;
pub mod op;
pub mod extent;
pub mod writer;
pub mod parser;
pub mod device;
pub mod lifecycle;
pub mod checkpoint;
pub mod merge;

pub use error::{CorruptionError, ParseError};
pub use codec::{CompressionAlgorithm, CompressionEngine, CodecError, open_engine};
pub use header::{CowHeader, FormatVersion, parse_header};
pub use op::{CowOperation, OpKind, RecordSize, operation_size};
pub use writer::{CowWriter, WriterOptions};
pub use parser::{CowParser, ParsedCow, TruncatedTail, parse_cow};
pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use lifecycle::{DeviceHandle, DeviceLifecycleManager, MappingError, MappingFacility, MappingKind, MappingSpec};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, MergeCheckpoint};
pub use merge::{CancelToken, MergeConfig, MergeCoordinator, MergeError, MergeState, RunOutcome, StepOutcome};
