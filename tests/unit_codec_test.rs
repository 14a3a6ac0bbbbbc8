use bytes::{Bytes, BytesMut};
use olivinedb::core::OlivineError;
use olivinedb::core::protocol::codec::{
    FrameCodec, WireFormat, decode_batch_envelope, decode_client_message, decode_server_message,
    encode_batch_envelope, encode_client_message, encode_server_message,
};
use olivinedb::core::protocol::{ClientMessage, ServerMessage};
use tokio_util::codec::{Decoder, Encoder};

#[tokio::test]
async fn test_frame_codec_round_trip() {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    codec
        .encode(Bytes::from_static(b"{\"type\":\"PING\"}"), &mut buf)
        .unwrap();
    // Partial delivery: nothing decodes until the full frame arrives.
    let mut partial = BytesMut::from(&buf[..3]);
    assert!(codec.decode(&mut partial).unwrap().is_none());
    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&decoded[..], b"{\"type\":\"PING\"}");
}

#[tokio::test]
async fn test_batch_envelope_round_trip() {
    let frames = vec![
        Bytes::from_static(b"one"),
        Bytes::from_static(b""),
        Bytes::from_static(b"three"),
    ];
    let (count, data) = encode_batch_envelope(&frames);
    assert_eq!(count, 3);
    let decoded = decode_batch_envelope(&data).unwrap();
    assert_eq!(decoded, frames);
}

#[tokio::test]
async fn test_truncated_batch_envelope_is_rejected() {
    let (_, data) = encode_batch_envelope(&[Bytes::from_static(b"payload")]);
    let err = decode_batch_envelope(&data[..data.len() - 2]).unwrap_err();
    assert!(matches!(err, OlivineError::Protocol(_)));
}

#[tokio::test]
async fn test_unknown_type_is_distinguished_from_schema_error() {
    let err = decode_client_message(b"{\"type\":\"NO_SUCH_VERB\"}").unwrap_err();
    assert!(matches!(err, OlivineError::UnknownMessageType(_)));
    let err = decode_client_message(b"{\"no_type\":true}").unwrap_err();
    assert!(matches!(err, OlivineError::Protocol(_)));
}

#[tokio::test]
async fn test_binary_and_json_encodings_round_trip() {
    let message = ClientMessage::Ping { timestamp: 42 };
    for format in [WireFormat::Binary, WireFormat::Json] {
        let payload = encode_client_message(&message, format).unwrap();
        let (decoded, detected) = decode_client_message(&payload).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(detected, format);
    }

    let reply = ServerMessage::Pong { timestamp: 42 };
    for format in [WireFormat::Binary, WireFormat::Json] {
        let payload = encode_server_message(&reply, format).unwrap();
        assert_eq!(decode_server_message(&payload).unwrap(), reply);
    }
}
