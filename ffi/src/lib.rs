pub mod call;
pub mod convert;
pub mod error;
pub mod layout;
pub mod marshal;
pub mod sid;

pub use call::{CallConv, CallEngine};
pub use error::{FfiError, FfiResult};
pub use layout::{compile, Descriptor, Field, TypeTag};
pub use marshal::{pack, unpack, MAX_UNPACK_NAMED, MAX_UNPACK_VALUES};
