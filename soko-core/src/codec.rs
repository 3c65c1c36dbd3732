//! Opaque callback tokens.
//!
//! Layout: one discriminator byte, then `(presence, value)` pairs in a fixed order.
//! Presence is a `0`/`1` byte; absent values are written as zeroes so every token of a
//! kind has the same length. Instants travel as little-endian Unix seconds; train keys and
//! search windows truncate to whole seconds on construction. The byte string is
//! base64url-encoded without padding to stay well inside Telegram's 64-byte
//! `callback_data` limit.
//!
//! Decoding never fails loudly: the payload comes back from the client, so anything that
//! is not a well-formed token yields `None`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::context::{RequestContext, TrainQuery};
use crate::train::{Direction, TrainKey};

const CONTEXT_TAG: u8 = 137;
const QUERY_TAG: u8 = 139;
const NUMBER_WIDTH: usize = 4;
const INSTANT_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackToken {
    Context(RequestContext),
    Query(TrainQuery),
}

impl CallbackToken {
    pub fn encode(&self) -> String {
        match self {
            CallbackToken::Context(ctx) => encode_context(ctx),
            CallbackToken::Query(query) => encode_query(query),
        }
    }

    pub fn decode(token: &str) -> Option<Self> {
        decode(token)
    }
}

pub fn encode_context(ctx: &RequestContext) -> String {
    let mut w = Writer::new(CONTEXT_TAG);
    w.flag(ctx.cancel);
    w.flag(ctx.spectate);
    w.optional(ctx.direction, 1, |w, d| w.u8(d.as_byte()));
    w.optional(ctx.search_start, INSTANT_WIDTH, Writer::instant);
    w.optional(ctx.search_end, INSTANT_WIDTH, Writer::instant);
    w.optional(ctx.train_number, NUMBER_WIDTH, Writer::i32);
    w.optional(ctx.departure, INSTANT_WIDTH, Writer::instant);
    w.flag(ctx.leave);
    w.finish()
}

pub fn encode_query(query: &TrainQuery) -> String {
    let mut w = Writer::new(QUERY_TAG);
    w.optional(Some(query.key.number), NUMBER_WIDTH, Writer::i32);
    w.optional(Some(query.key.departure), INSTANT_WIDTH, Writer::instant);
    w.flag(query.leave);
    w.finish()
}

pub fn decode(token: &str) -> Option<CallbackToken> {
    let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
    decode_bytes(&bytes)
}

/// Total over arbitrary input.
pub fn decode_bytes(bytes: &[u8]) -> Option<CallbackToken> {
    let (&tag, rest) = bytes.split_first()?;
    let mut r = Reader { buf: rest };
    let token = match tag {
        CONTEXT_TAG => CallbackToken::Context(RequestContext {
            cancel: r.flag()?,
            spectate: r.flag()?,
            direction: r.optional(1, |r| r.u8().and_then(Direction::from_byte))?,
            search_start: r.optional(INSTANT_WIDTH, Reader::instant)?,
            search_end: r.optional(INSTANT_WIDTH, Reader::instant)?,
            train_number: r.optional(NUMBER_WIDTH, Reader::i32)?,
            departure: r.optional(INSTANT_WIDTH, Reader::instant)?,
            leave: r.flag()?,
        }),
        QUERY_TAG => {
            let number = r.optional(NUMBER_WIDTH, Reader::i32)??;
            let departure = r.optional(INSTANT_WIDTH, Reader::instant)??;
            let leave = r.flag()?;
            CallbackToken::Query(TrainQuery { key: TrainKey::new(number, departure), leave })
        }
        _ => return None,
    };
    r.buf.is_empty().then_some(token)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(tag: u8) -> Self {
        let mut buf = Vec::with_capacity(48);
        buf.push(tag);
        Self { buf }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.u8(value as u8);
    }

    fn i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn instant(&mut self, value: DateTime<Utc>) {
        self.buf.extend_from_slice(&value.timestamp().to_le_bytes());
    }

    fn optional<T>(&mut self, value: Option<T>, width: usize, write: impl FnOnce(&mut Self, T)) {
        match value {
            Some(value) => {
                self.u8(1);
                write(self, value);
            }
            None => {
                self.u8(0);
                self.buf.resize(self.buf.len() + width, 0);
            }
        }
    }

    fn flag(&mut self, value: bool) {
        self.optional(Some(value), 1, Writer::bool);
    }

    fn finish(self) -> String {
        URL_SAFE_NO_PAD.encode(self.buf)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let (head, tail) = self.buf.split_first_chunk::<N>()?;
        self.buf = tail;
        Some(*head)
    }

    fn skip(&mut self, width: usize) -> Option<()> {
        self.buf = self.buf.get(width..)?;
        Some(())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    fn bool(&mut self) -> Option<bool> {
        match self.u8()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    fn i32(&mut self) -> Option<i32> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    fn instant(&mut self) -> Option<DateTime<Utc>> {
        let seconds = self.take::<8>().map(i64::from_le_bytes)?;
        DateTime::from_timestamp(seconds, 0)
    }

    /// Outer `None` means malformed input, inner `None` means the field is unset.
    fn optional<T>(&mut self, width: usize, read: impl FnOnce(&mut Self) -> Option<T>) -> Option<Option<T>> {
        if self.bool()? {
            read(self).map(Some)
        } else {
            self.skip(width).map(|_| None)
        }
    }

    /// An absent flag reads as false.
    fn flag(&mut self) -> Option<bool> {
        self.optional(1, Reader::bool).map(|v| v.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SearchWindow;
    use chrono::TimeZone;

    fn instant(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, minute, 0).unwrap()
    }

    fn sample_contexts() -> Vec<RequestContext> {
        let window = SearchWindow::new(instant(2, 0), instant(10, 0));
        let key = TrainKey::new(7411, instant(6, 15));
        vec![
            RequestContext::empty(),
            RequestContext::spectating(),
            RequestContext::empty().with_cancel(),
            // Direction zero must survive as "set", not collapse into "unset".
            RequestContext::empty().with_direction(Direction::NoviSadToBelgrade),
            RequestContext::empty().with_direction(Direction::BelgradeToNoviSad).with_window(window),
            RequestContext::spectating()
                .with_direction(Direction::BelgradeToNoviSad)
                .with_window(window)
                .with_train(key),
            RequestContext::empty()
                .with_direction(Direction::NoviSadToBelgrade)
                .with_window(window)
                .with_train(key)
                .with_leave()
                .with_cancel(),
            RequestContext::empty().with_train(TrainKey::new(i32::MAX, DateTime::from_timestamp(0, 0).unwrap())),
        ]
    }

    #[test]
    fn test_context_round_trip() {
        for ctx in sample_contexts() {
            let token = encode_context(&ctx);
            assert_eq!(decode(&token), Some(CallbackToken::Context(ctx)), "token {}", token);
        }
    }

    #[test]
    fn test_query_round_trip() {
        let key = TrainKey::new(12, instant(18, 40));
        for query in [TrainQuery::refresh(key), TrainQuery::leave(key)] {
            let token = CallbackToken::Query(query);
            assert_eq!(CallbackToken::decode(&token.encode()), Some(token));
        }
    }

    #[test]
    fn test_sub_second_instants_round_trip() {
        let half = instant(6, 15) + chrono::Duration::milliseconds(500);
        let key = TrainKey::new(7411, half);
        assert_eq!(key.departure, instant(6, 15));

        let ctx = RequestContext::empty()
            .with_direction(Direction::NoviSadToBelgrade)
            .with_window(SearchWindow::new(half, half + chrono::Duration::hours(8)))
            .with_train(key);
        assert_eq!(decode(&encode_context(&ctx)), Some(CallbackToken::Context(ctx)));

        let query = CallbackToken::Query(TrainQuery::leave(key));
        assert_eq!(decode(&query.encode()), Some(query));
    }

    #[test]
    fn test_tokens_fit_callback_data_limit() {
        let full = RequestContext::spectating()
            .with_direction(Direction::BelgradeToNoviSad)
            .with_window(SearchWindow::new(instant(2, 0), instant(10, 0)))
            .with_train(TrainKey::new(7411, instant(6, 15)))
            .with_leave()
            .with_cancel();
        assert!(encode_context(&full).len() <= 64);
        assert!(encode_query(&TrainQuery::leave(TrainKey::new(7411, instant(6, 15)))).len() <= 64);
    }

    #[test]
    fn test_token_kinds_are_distinguished() {
        let ctx = encode_context(&RequestContext::empty());
        let query = encode_query(&TrainQuery::refresh(TrainKey::new(1, instant(1, 0))));
        assert!(matches!(decode(&ctx), Some(CallbackToken::Context(_))));
        assert!(matches!(decode(&query), Some(CallbackToken::Query(_))));
    }

    #[test]
    fn test_garbage_is_no_match() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("not base64 !!"), None);
        assert_eq!(decode_bytes(&[]), None);
        assert_eq!(decode_bytes(&[42]), None);
        assert_eq!(decode_bytes(&[CONTEXT_TAG]), None);
    }

    #[test]
    fn test_truncated_tokens_are_no_match() {
        let bytes = URL_SAFE_NO_PAD
            .decode(encode_context(&RequestContext::empty().with_direction(Direction::BelgradeToNoviSad)))
            .unwrap();
        for len in 0..bytes.len() {
            assert_eq!(decode_bytes(&bytes[..len]), None, "prefix of {} bytes", len);
        }
        let mut extended = bytes.clone();
        extended.push(0);
        assert_eq!(decode_bytes(&extended), None);
    }

    #[test]
    fn test_invalid_enum_and_flag_bytes_are_no_match() {
        let mut bytes = URL_SAFE_NO_PAD
            .decode(encode_context(&RequestContext::empty().with_direction(Direction::BelgradeToNoviSad)))
            .unwrap();
        // tag, cancel(2), spectate(2), direction presence at index 5, value at 6
        bytes[6] = 9;
        assert_eq!(decode_bytes(&bytes), None);
        bytes[6] = 1;
        bytes[5] = 2;
        assert_eq!(decode_bytes(&bytes), None);
    }

    #[test]
    fn test_query_without_key_is_no_match() {
        let mut bytes = URL_SAFE_NO_PAD
            .decode(encode_query(&TrainQuery::refresh(TrainKey::new(5, instant(5, 0)))))
            .unwrap();
        bytes[1] = 0;
        assert_eq!(decode_bytes(&bytes), None);
    }

    #[test]
    fn test_decode_is_total_over_arbitrary_bytes() {
        // Deterministic pseudo-random walk over byte strings of every small length.
        let mut seed: u32 = 0x9E37_79B9;
        for len in 0..64 {
            for _ in 0..64 {
                let bytes: Vec<u8> = (0..len)
                    .map(|_| {
                        seed ^= seed << 13;
                        seed ^= seed >> 17;
                        seed ^= seed << 5;
                        (seed & 0xFF) as u8
                    })
                    .collect();
                let _ = decode_bytes(&bytes);
                let mut tagged = bytes.clone();
                tagged.insert(0, CONTEXT_TAG);
                let _ = decode_bytes(&tagged);
                tagged[0] = QUERY_TAG;
                let _ = decode_bytes(&tagged);
            }
        }
    }
}
