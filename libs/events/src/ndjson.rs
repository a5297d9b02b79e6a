//! Newline-delimited JSON framing for streaming endpoints.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::EventError;

/// Content type of NDJSON responses.
pub const CONTENT_TYPE: &str = "application/x-ndjson";

/// Serializes one record as a JSON line.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, EventError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Decodes a byte stream of JSON lines into records.
///
/// Chunk boundaries need not align with lines. Blank lines are skipped. The
/// stream ends after the first error.
pub fn decode<T, S, E>(body: S) -> BoxStream<'static, Result<T, EventError>>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    struct State<S> {
        body: std::pin::Pin<Box<S>>,
        buf: BytesMut,
        done: bool,
    }

    let state = State {
        body: Box::pin(body),
        buf: BytesMut::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                let line = state.buf.split_to(pos);
                state.buf.advance(1);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let item = serde_json::from_slice::<T>(&line).map_err(EventError::from);
                if item.is_err() {
                    state.done = true;
                }
                return Some((item, state));
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(EventError::Stream(e.to_string())), state));
                }
                None => {
                    state.done = true;
                    if state.buf.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let item = serde_json::from_slice::<T>(&state.buf).map_err(EventError::from);
                    return Some((item, state));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Line {
        n: u32,
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_decode_split_chunks() {
        let decoded: Vec<Line> = decode(chunks(&["{\"n\":", "1}\n{\"n\"", ":2}\n\n{\"n\":3}"]))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(decoded, vec![Line { n: 1 }, Line { n: 2 }, Line { n: 3 }]);
    }

    #[tokio::test]
    async fn test_decode_stops_after_error() {
        let results: Vec<Result<Line, EventError>> =
            decode(chunks(&["{\"n\":1}\nnot json\n{\"n\":2}\n"])).collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(EventError::Serialization(_))));
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_independent_of_chunking(
            values in proptest::collection::vec(0u32..1000, 0..20),
            cut in 1usize..16,
        ) {
            let mut wire = Vec::new();
            for n in &values {
                wire.extend_from_slice(&encode(&Line { n: *n }).unwrap());
            }
            let parts: Vec<Result<Bytes, std::io::Error>> = wire
                .chunks(cut)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded: Vec<u32> = rt.block_on(
                decode::<Line, _, _>(stream::iter(parts))
                    .map(|r| r.unwrap().n)
                    .collect(),
            );
            proptest::prop_assert_eq!(decoded, values);
        }
    }

    #[test]
    fn test_encode_appends_newline() {
        let bytes = encode(&Line { n: 7 }).unwrap();
        assert_eq!(&bytes[..], b"{\"n\":7}\n");
    }
}
