//! Wire frame shapes and the length-delimited codec that (de)serializes them.
//!
//! Frames are bincode-encoded Rust enums carried over a [`LengthDelimitedCodec`]
//! so that a partial TCP read never hands the session layer a truncated
//! logical message. Client and server frames are distinct enums; a
//! connection only ever speaks one direction of this pair.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::CacheServerError;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    AddChunk {
        key: Fingerprint,
        data_size: u64,
        num_chunks: u32,
        chunk_idx: u32,
        chunk_bytes: Vec<u8>,
    },
    GetChunk {
        key: Fingerprint,
        chunk_idx: u32,
    },
    Remove {
        key: Fingerprint,
    },
    Clear,
    WarmUp {
        key: Fingerprint,
    },
    StatusRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Added {
        key: Fingerprint,
        ok: bool,
    },
    Chunk {
        key: Fingerprint,
        data_size: u64,
        num_chunks: u32,
        chunk_idx: u32,
        chunk_bytes: Vec<u8>,
    },
    Removed {
        key: Fingerprint,
        ok: bool,
    },
    Cleared {
        ok: bool,
    },
    Status {
        occupied_size: u64,
        max_size: u64,
        item_count: u64,
    },
}

impl ServerFrame {
    /// The canonical "not found / cancelled" reply for a chunk request.
    pub fn empty_chunk(key: Fingerprint) -> Self {
        ServerFrame::Chunk {
            key,
            data_size: 0,
            num_chunks: 0,
            chunk_idx: 0,
            chunk_bytes: Vec::new(),
        }
    }

    pub fn is_empty_chunk(&self) -> bool {
        matches!(
            self,
            ServerFrame::Chunk {
                data_size: 0,
                num_chunks: 0,
                chunk_idx: 0,
                chunk_bytes,
                ..
            } if chunk_bytes.is_empty()
        )
    }
}

/// Generic bincode-over-length-delimited codec, parameterized by frame type
/// so the client and server sides share one implementation.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: std::marker::PhantomData<T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = CacheServerError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::serialize(&item)?;
        self.inner
            .encode(Bytes::from(bytes), dst)
            .map_err(|e| CacheServerError::Protocol(e.to_string()))
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CacheServerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, Self::Error> {
        match self
            .inner
            .decode(src)
            .map_err(|e| CacheServerError::Protocol(e.to_string()))?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

pub type ClientFrameCodec = FrameCodec<ClientFrame>;
pub type ServerFrameCodec = FrameCodec<ServerFrame>;

/// Full-duplex codec for a server-side connection: decodes [`ClientFrame`]s
/// coming off a client socket, encodes [`ServerFrame`]s going back to it.
#[derive(Default)]
pub struct ServerSideCodec(LengthDelimitedCodec);

impl ServerSideCodec {
    pub fn new() -> Self {
        Self(LengthDelimitedCodec::new())
    }
}

impl Decoder for ServerSideCodec {
    type Item = ClientFrame;
    type Error = CacheServerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientFrame>, Self::Error> {
        match self.0.decode(src).map_err(|e| CacheServerError::Protocol(e.to_string()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<ServerFrame> for ServerSideCodec {
    type Error = CacheServerError;

    fn encode(&mut self, item: ServerFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::serialize(&item)?;
        self.0
            .encode(Bytes::from(bytes), dst)
            .map_err(|e| CacheServerError::Protocol(e.to_string()))
    }
}

/// Full-duplex codec for the client-side connection this server keeps open to
/// its upstream: encodes outgoing [`ClientFrame`]s, decodes incoming
/// [`ServerFrame`]s.
#[derive(Default)]
pub struct ClientSideCodec(LengthDelimitedCodec);

impl ClientSideCodec {
    pub fn new() -> Self {
        Self(LengthDelimitedCodec::new())
    }
}

impl Decoder for ClientSideCodec {
    type Item = ServerFrame;
    type Error = CacheServerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerFrame>, Self::Error> {
        match self.0.decode(src).map_err(|e| CacheServerError::Protocol(e.to_string()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<ClientFrame> for ClientSideCodec {
    type Error = CacheServerError;

    fn encode(&mut self, item: ClientFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::serialize(&item)?;
        self.0
            .encode(Bytes::from(bytes), dst)
            .map_err(|e| CacheServerError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_chunk_round_trips_through_the_codec() {
        let mut codec = ClientFrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = ClientFrame::AddChunk {
            key: Fingerprint::of(b"k"),
            data_size: 3,
            num_chunks: 1,
            chunk_idx: 0,
            chunk_bytes: vec![1, 2, 3],
        };
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_yields_none_until_complete() {
        let mut codec = ServerFrameCodec::new();
        let mut encode_buf = BytesMut::new();
        let frame = ServerFrame::Status {
            occupied_size: 10,
            max_size: 20,
            item_count: 1,
        };
        codec.encode(frame.clone(), &mut encode_buf).unwrap();

        let mut partial = BytesMut::from(&encode_buf[..encode_buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encode_buf[encode_buf.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), frame);
    }

    #[test]
    fn empty_chunk_is_the_canonical_not_found_reply() {
        let empty = ServerFrame::empty_chunk(Fingerprint::of(b"k"));
        assert!(empty.is_empty_chunk());
        let real = ServerFrame::Chunk {
            key: Fingerprint::of(b"k"),
            data_size: 5,
            num_chunks: 1,
            chunk_idx: 0,
            chunk_bytes: vec![1, 2, 3, 4, 5],
        };
        assert!(!real.is_empty_chunk());
    }
}
