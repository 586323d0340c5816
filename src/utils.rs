//! Utility functions for identifiers, hashing and serialization

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::CodecError;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Encodes `value` into cbor and returns its sha256 digest along with the encoding.
pub fn digest_cbor<T>(what: &'static str, value: &T) -> Result<(String, Vec<u8>), CodecError>
where
    T: minicbor::Encode<()>,
{
    let cbor = to_cbor(what, value)?;
    let hash = sha256::digest(&cbor);

    Ok((hash, cbor))
}

pub fn to_cbor<T>(what: &'static str, value: &T) -> Result<Vec<u8>, CodecError>
where
    T: minicbor::Encode<()>,
{
    minicbor::to_vec(value).map_err(|e| CodecError::Encode {
        what,
        reason: e.to_string(),
    })
}

pub fn from_cbor<T>(what: &'static str, bytes: &[u8]) -> Result<T, CodecError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| CodecError::Decode {
        what,
        reason: e.to_string(),
    })
}
