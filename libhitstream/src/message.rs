use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::{FrameError, MessageError};

/// A single decoded front-end message.
///
/// Every message on the wire is one little endian u64 whose top nibble selects the variant.
/// See the layout in [`crate::constants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawMessage {
    Hit {
        channel: u16,
        amplitude: u16,
        coarse_time: u32,
    },
    Epoch {
        value: u64,
    },
    TsMsb {
        value: u64,
    },
    Status {
        flags: u32,
    },
    Empty,
    Dummy,
}

impl RawMessage {
    /// Decode a single raw word
    pub fn from_word(word: u64) -> Result<Self, MessageError> {
        let tag = ((word >> TAG_SHIFT) & TAG_MASK) as u8;
        match tag {
            TAG_HIT => Ok(Self::Hit {
                channel: ((word >> HIT_CHANNEL_SHIFT) & HIT_CHANNEL_MASK) as u16,
                amplitude: ((word >> HIT_AMPLITUDE_SHIFT) & HIT_AMPLITUDE_MASK) as u16,
                coarse_time: (word & HIT_COARSE_TIME_MASK) as u32,
            }),
            TAG_EPOCH => Ok(Self::Epoch {
                value: word & MARKER_VALUE_MASK,
            }),
            TAG_TS_MSB => Ok(Self::TsMsb {
                value: word & MARKER_VALUE_MASK,
            }),
            TAG_STATUS => Ok(Self::Status {
                flags: (word & STATUS_FLAGS_MASK) as u32,
            }),
            TAG_EMPTY => Ok(Self::Empty),
            TAG_DUMMY => Ok(Self::Dummy),
            _ => Err(MessageError::UnknownTag(tag, word)),
        }
    }

    /// Encode back into a raw word. Fields wider than their slot are masked.
    pub fn to_word(&self) -> u64 {
        let tagged = |tag: u8| (tag as u64) << TAG_SHIFT;
        match self {
            Self::Hit {
                channel,
                amplitude,
                coarse_time,
            } => {
                tagged(TAG_HIT)
                    | ((*channel as u64 & HIT_CHANNEL_MASK) << HIT_CHANNEL_SHIFT)
                    | ((*amplitude as u64 & HIT_AMPLITUDE_MASK) << HIT_AMPLITUDE_SHIFT)
                    | (*coarse_time as u64 & HIT_COARSE_TIME_MASK)
            }
            Self::Epoch { value } => tagged(TAG_EPOCH) | (value & MARKER_VALUE_MASK),
            Self::TsMsb { value } => tagged(TAG_TS_MSB) | (value & MARKER_VALUE_MASK),
            Self::Status { flags } => tagged(TAG_STATUS) | (*flags as u64 & STATUS_FLAGS_MASK),
            Self::Empty => tagged(TAG_EMPTY),
            Self::Dummy => tagged(TAG_DUMMY),
        }
    }

    /// Epoch and TsMsb both carry the slow counter
    pub fn marker_value(&self) -> Option<u64> {
        match self {
            Self::Epoch { value } | Self::TsMsb { value } => Some(*value),
            _ => None,
        }
    }
}

/// Split a frame into its raw words.
///
/// Fails with IncorrectFrameSize when the frame does not hold a whole number of messages.
pub fn frame_words(bytes: &[u8]) -> Result<Vec<u64>, FrameError> {
    if bytes.len() % MESSAGE_SIZE_BYTES != 0 {
        return Err(FrameError::IncorrectFrameSize(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(MESSAGE_SIZE_BYTES)
        .map(LittleEndian::read_u64)
        .collect())
}

/// Decode a whole frame into typed messages.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<RawMessage>, FrameError> {
    let words = frame_words(bytes)?;
    let mut messages = Vec::with_capacity(words.len());
    for word in words {
        messages.push(RawMessage::from_word(word)?);
    }
    Ok(messages)
}

/// Serialize messages into a frame buffer
pub fn encode_frame(messages: &[RawMessage]) -> Vec<u8> {
    let mut bytes = vec![0u8; messages.len() * MESSAGE_SIZE_BYTES];
    for (message, chunk) in messages
        .iter()
        .zip(bytes.chunks_exact_mut(MESSAGE_SIZE_BYTES))
    {
        LittleEndian::write_u64(chunk, message.to_word());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_layout() {
        let hit = RawMessage::Hit {
            channel: 0x0123,
            amplitude: 0x0456,
            coarse_time: 0x0789_abcd,
        };
        let word = hit.to_word();
        assert_eq!(word >> TAG_SHIFT, TAG_HIT as u64);
        assert_eq!(RawMessage::from_word(word), Ok(hit));
    }

    #[test]
    fn test_decode_frame_mixed() {
        let messages = vec![
            RawMessage::Epoch { value: 42 },
            RawMessage::Hit {
                channel: 3,
                amplitude: 100,
                coarse_time: 17,
            },
            RawMessage::Status { flags: 0x5 },
            RawMessage::Dummy,
            RawMessage::Empty,
        ];
        let bytes = encode_frame(&messages);
        assert_eq!(bytes.len(), messages.len() * MESSAGE_SIZE_BYTES);
        assert_eq!(decode_frame(&bytes), Ok(messages));
    }

    #[test]
    fn test_partial_frame_is_format_error() {
        let mut bytes = encode_frame(&[RawMessage::Epoch { value: 1 }]);
        bytes.push(0xff);
        assert_eq!(decode_frame(&bytes), Err(FrameError::IncorrectFrameSize(9)));
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let word: u64 = 0xE000_0000_0000_0001;
        let bytes = word.to_le_bytes();
        match decode_frame(&bytes) {
            Err(FrameError::BadMessage(MessageError::UnknownTag(tag, raw))) => {
                assert_eq!(tag, 0xE);
                assert_eq!(raw, word);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_empty_frame() {
        assert_eq!(decode_frame(&[]), Ok(vec![]));
    }
}
