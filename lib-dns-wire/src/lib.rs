//! DNS message wire format, as far as a stub server and an iterative
//! resolver need it: the 12-octet header, questions, and resource
//! records with opaque RDATA.  Serialisation never compresses names;
//! deserialisation transparently follows compression pointers.
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::struct_excessive_bools)]

pub mod deserialise;
pub mod serialise;
pub mod types;
