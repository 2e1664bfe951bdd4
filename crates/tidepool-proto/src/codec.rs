//! Pluggable batch codec. Any bijective `Vec<Command> ⇄ bytes` serializer
//! satisfies the transport contract; JSON is the default.

use thiserror::Error;

use crate::Command;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode command batch: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode command batch: {0}")]
    Decode(#[source] serde_json::Error),
}

pub trait CommandCodec: Send + Sync {
    fn encode(&self, commands: &[Command]) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Command>, CodecError>;

    /// Content type advertised on the HTTP round trip.
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

/// Default codec: an ordered JSON array of tagged command objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CommandCodec for JsonCodec {
    fn encode(&self, commands: &[Command]) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(commands).map_err(CodecError::Encode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Command>, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BeanId, PmValue};

    #[test]
    fn encodes_ordered_array() {
        let commands = vec![
            Command::CreateContext,
            Command::ValueChanged {
                bean_id: BeanId(1),
                attribute: "x".into(),
                old_value: PmValue::Null,
                new_value: PmValue::Int(5),
            },
            Command::StartLongPoll,
        ];
        let codec = JsonCodec;
        let bytes = codec.encode(&commands).expect("encode");
        let decoded = codec.decode(&bytes).expect("decode");
        assert_eq!(decoded, commands);
    }

    #[test]
    fn decode_rejects_garbage() {
        let codec = JsonCodec;
        assert!(matches!(
            codec.decode(b"not json"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn empty_batch_is_valid() {
        let codec = JsonCodec;
        let bytes = codec.encode(&[]).expect("encode");
        assert_eq!(codec.decode(&bytes).expect("decode"), Vec::<Command>::new());
    }
}
