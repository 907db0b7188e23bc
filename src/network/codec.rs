use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::common::NetworkError;

/// Largest frame either side will accept. A header announcing more is
/// rejected before any of the body is buffered.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Length-prefixed JSON frames. Decodes `In`, encodes anything serializable.
#[derive(Debug)]
pub struct JsonCodec<In> {
    length_codec: LengthDelimitedCodec,
    _marker: PhantomData<fn() -> In>,
}

impl<In> JsonCodec<In> {
    pub fn new() -> Self {
        JsonCodec::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        JsonCodec {
            length_codec: LengthDelimitedCodec::builder().max_frame_length(max).new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<In> Default for JsonCodec<In> {
    fn default() -> Self {
        JsonCodec::new()
    }
}

impl<In: DeserializeOwned> Decoder for JsonCodec<In> {
    type Item = In;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.length_codec.decode(src)? else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonCodec<In> {
    type Error = NetworkError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        self.length_codec.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::snapshot::Message;

    #[tokio::test]
    async fn test_frames_round_trip_over_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, JsonCodec::<Message>::new());
        let mut reader = FramedRead::new(server, JsonCodec::<Message>::new());

        let first = Message::regular(0, "0".into(), 1, "line\nbreak");
        let second = Message::marker(0, "0".into(), 2);
        writer.send(&first).await.unwrap();
        writer.send(&second).await.unwrap();
        drop(writer);

        assert_eq!(reader.next().await.unwrap().unwrap(), first);
        assert_eq!(reader.next().await.unwrap().unwrap(), second);
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_a_codec_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FramedRead::new(server, JsonCodec::<Message>::new());

        let body = b"not json";
        client.write_u32(body.len() as u32).await.unwrap();
        client.write_all(body).await.unwrap();

        let result = reader.next().await.unwrap();
        assert!(matches!(result, Err(NetworkError::Codec(_))));
    }

    #[test]
    fn test_oversized_header_is_rejected_before_body() {
        let mut codec = JsonCodec::<Message>::with_max_frame_length(64);
        let mut buffer = BytesMut::new();
        buffer.put_u32(65);
        buffer.put_slice(b"{");

        match codec.decode(&mut buffer) {
            Err(NetworkError::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::InvalidData),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_oversized_message_is_not_encoded() {
        let mut codec = JsonCodec::<Message>::with_max_frame_length(64);
        let mut buffer = BytesMut::new();
        let message = Message::regular(0, "0".into(), 1, "x".repeat(128));

        assert!(codec.encode(&message, &mut buffer).is_err());
        assert!(buffer.is_empty());
    }
}
