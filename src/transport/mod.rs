//! Transports - mechanisms that yield a byte-stream endpoint for a session.

pub mod channel;
pub mod direct;

use tokio::io::{AsyncRead, AsyncWrite};

/// What a transport hands the session: one ordered, reliable stream.
pub trait StreamEndpoint: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamEndpoint for T {}

pub type ByteStream = Box<dyn StreamEndpoint>;
