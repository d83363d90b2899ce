use thiserror::Error;

use crate::Word;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("secret phrase must not be empty")]
    EmptySecret,
    #[error("payload must not be empty")]
    EmptyPayload,
    #[error("framed message needs {framed} words but only {capacity} fit")]
    FrameOverflow { framed: usize, capacity: usize },
}

/// Why a dump did not yield a message. This is an ordinary outcome of
/// listening, not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeNotFound {
    #[error("first delimiter missing")]
    FirstDelimiterMissing,
    #[error("second delimiter missing")]
    SecondDelimiterMissing,
    #[error("message exhausted")]
    MessageExhausted,
}

/// A frame left-packed at word offset 0 of a buffer of `capacity` words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    words: Vec<Word>,
    capacity: usize,
}

impl EncodedMessage {
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Number of meaningful words; the writer kernel's message-length parameter.
    pub fn framed_len(&self) -> usize {
        self.words.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The full buffer the writer uploads: the frame followed by zeros.
    pub fn into_buffer(self) -> Vec<Word> {
        let mut buffer = self.words;
        buffer.resize(self.capacity, 0);
        buffer
    }
}

/// Frames `payload` between two copies of `secret_phrase`, one word per
/// character (its code point).
pub fn encode(
    secret_phrase: &str,
    payload: &str,
    capacity: usize,
) -> Result<EncodedMessage, EncodingError> {
    if secret_phrase.is_empty() {
        return Err(EncodingError::EmptySecret);
    }
    if payload.is_empty() {
        return Err(EncodingError::EmptyPayload);
    }

    let secret_len = secret_phrase.chars().count();
    let payload_len = payload.chars().count();
    let framed = secret_len
        .checked_mul(2)
        .and_then(|len| len.checked_add(payload_len))
        .ok_or(EncodingError::FrameOverflow {
            framed: usize::MAX,
            capacity,
        })?;
    if framed > capacity {
        return Err(EncodingError::FrameOverflow { framed, capacity });
    }

    let mut words = Vec::with_capacity(framed);
    push_chars(&mut words, secret_phrase);
    push_chars(&mut words, payload);
    push_chars(&mut words, secret_phrase);
    debug_assert_eq!(words.len(), framed);

    Ok(EncodedMessage { words, capacity })
}

/// A one-word frame. The writer kernel repeats it across all of workgroup
/// memory, so a histogram listener sees it as a spike.
pub fn encode_canary(canary: Word, capacity: usize) -> Result<EncodedMessage, EncodingError> {
    if capacity == 0 {
        return Err(EncodingError::FrameOverflow {
            framed: 1,
            capacity,
        });
    }
    Ok(EncodedMessage {
        words: vec![canary],
        capacity,
    })
}

/// Maps each word to the Unicode scalar with that value. Words that are not
/// scalars (surrogates, values above U+10FFFF) are dropped without a trace,
/// so characters on either side of them become adjacent.
pub fn words_to_text(words: &[Word]) -> String {
    words.iter().filter_map(|&word| char::from_u32(word)).collect()
}

/// Recovers the first nonempty payload framed by `secret_phrase`.
///
/// An empty match between two adjacent delimiters is skipped and the scan
/// restarts from the second delimiter, so `KKHELLOK` (with `K` as the
/// secret) still yields `HELLO`.
pub fn decode(buffer: &[Word], secret_phrase: &str) -> Result<String, DecodeNotFound> {
    if secret_phrase.is_empty() {
        return Err(DecodeNotFound::FirstDelimiterMissing);
    }

    let text = words_to_text(buffer);
    let mut rest = text.as_str();
    loop {
        let first = rest
            .find(secret_phrase)
            .ok_or(DecodeNotFound::FirstDelimiterMissing)?;
        let chopped = &rest[first + secret_phrase.len()..];
        let second = chopped
            .find(secret_phrase)
            .ok_or(DecodeNotFound::SecondDelimiterMissing)?;

        let message = &chopped[..second];
        if !message.is_empty() {
            return Ok(message.to_owned());
        }

        rest = chopped;
        if rest.is_empty() {
            return Err(DecodeNotFound::MessageExhausted);
        }
    }
}

fn push_chars(words: &mut Vec<Word>, text: &str) {
    words.extend(text.chars().map(Word::from));
}
