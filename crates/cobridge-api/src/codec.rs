// CBOR payload codec used for every request and response body.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;

/// Serialize `value` to a CBOR byte vector.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a CBOR payload. An empty payload is a decode error.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty payload".into()));
    }
    ciborium::from_reader(bytes).map_err(|e| Error::Decode(e.to_string()))
}
