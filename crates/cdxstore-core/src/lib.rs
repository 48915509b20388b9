//! Core data model for cdxstore.
//!
//! A `Capture` describes one archived response. Captures travel in two
//! representations: the space-delimited CDX text line used on the wire, and
//! the ordered binary key/value pair stored in the index. Both codecs live
//! here, together with the SURT canonicalizer that produces the key
//! dimension shared by captures, aliases and access-control prefixes.

mod capture;
mod codec;
mod surt;

pub use capture::{Capture, ParseError, CDX_FIELD_COUNT};
pub use codec::{decode_row, encode_key, encode_value, query_prefix, CodecError};
pub use surt::surt_canonicalize;
