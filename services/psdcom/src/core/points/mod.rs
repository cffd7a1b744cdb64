//! Point model: decoding, mapping definitions and the mapping table

pub mod byte_order;
pub mod decoder;
pub mod mapping;
pub mod table;

pub use byte_order::ByteOrder;
pub use decoder::{decode, encode, DataType, TypedValue};
pub use mapping::{
    LogRule, PointLocation, PointMapping, SyncMode, SyncTarget, TargetBinding, TriggerState,
};
pub use table::{BuildReport, PointTable, PointTableHandle, ResolvedPoint, ResolvedSync};
