//! # uavcan-dsdl: UAVCAN v1.0 DSDL parser and CAN frame codec
//!
//! Reads a tree of DSDL definition files, builds a type table, flattens every compound type
//! into an ordered list of bit channels, and uses those channels to decode and encode the
//! payloads of UAVCAN CAN frames (with multi-frame reassembly).
//!
//! ## Definition tree
//!
//! Files are named `[<port id>.]<Name>.<major>.<minor>.uavcan` and live in namespace
//! directories below a root: `root/TestDsdl/413.PitotTube.1.0.uavcan` defines
//! `TestDsdl.PitotTube` on subject 413. A line `---` splits a service into request and
//! response sections.
//!
//! ```text
//! # pitot tube measurement
//! float32 pressure_delta
//! uint4 error_bf
//! uint8 MAX_ERRORS = 15
//! ```
//!
//! ## Pipeline
//!
//! - [`parser::DsdlParser`]: directory walk, per-line grammar, reference resolution
//! - [`rules::SerializationRules`]: channel tables keyed by subject/service id and name
//! - [`frame::UavcanFrame`]: CAN id and tail byte encode/decode
//! - [`storage::FrameStorage`]: reassembly of multi-frame transfers
//! - [`codec`]: payload bits to named values and back
//! - [`receiver::UavcanReceiver`]: all of the above behind one `on_frame_received` call
//!
//! ## Usage
//!
//! ```no_run
//! use uavcan_dsdl::{SerializationRules, UavcanReceiver};
//!
//! let rules = SerializationRules::load("dsdl")?;
//! let receiver = UavcanReceiver::new(rules);
//! if let Some(transfer) = receiver.on_frame_received(73506049, &[0, 64, 154, 68, 0, 224], 0)? {
//!     println!("{} {:?}", transfer.name, transfer.values);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bits;
pub mod codec;
pub mod frame;
pub mod parser;
pub mod receiver;
pub mod rules;
pub mod source;
pub mod storage;
pub mod types;

pub use codec::{parse_frame, serialize_frame, serialize_frame_values};
pub use frame::{FrameType, UavcanError, UavcanFrame};
pub use parser::{parse_all_under, DsdlError, DsdlParser};
pub use receiver::{ParsedTransfer, UavcanReceiver};
pub use rules::{node_ids, SerializationRules, UavcanChannel, UavcanService};
pub use source::{FileProvider, LocalFiles, MemoryFiles};
pub use types::{CompoundType, DsdlType, TypeId, TypeTable};
