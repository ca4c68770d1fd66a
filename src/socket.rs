//! # Summary
//!
//! This module abstracts over connections that leave the process: client
//! to replica, and replica to replica.
//!
//! Transport is `tokio`'s asynchronous TCP stream, framed with its
//! length-delimited codec and serialized with `bincode` through
//! `tokio-serde-bincode`. Every user of a connection here owns both of
//! its directions at once, so instead of separate stream and sink halves
//! a connection is a single duplex `Link` polled and written through
//! inherent methods. Encoding and transport errors all collapse into a
//! dead link; callers drop it and redial if they care.

use futures::{sink, stream};
use tokio::{io, net};
use tokio::codec::{FramedRead, FramedWrite, LengthDelimitedCodec, length_delimited};
use tokio::prelude::*;
use tokio_serde_bincode::{ReadBincode, WriteBincode};

type Decoded<R> = ReadBincode<
    stream::FromErr<FramedRead<io::ReadHalf<net::TcpStream>, LengthDelimitedCodec>, bincode::Error>,
    R,
>;

type Encoded<T> = WriteBincode<
    sink::SinkFromErr<FramedWrite<io::WriteHalf<net::TcpStream>, LengthDelimitedCodec>, bincode::Error>,
    T,
>;

/// A duplex connection carrying inbound values of type `R` and outbound
/// values of type `T`, both as length-delimited bincode frames.
pub struct Link<R, T> {
    rx: Decoded<R>,
    tx: Encoded<T>,
}

impl<R, T> Link<R, T>
where R: serde::de::DeserializeOwned,
      T: serde::Serialize,
{
    pub fn new(stream: net::TcpStream) -> Self {
        let framing = length_delimited::Builder::new();
        let (rx, tx) = stream.split();
        let rx = framing.new_read(rx).from_err::<bincode::Error>();
        let tx = framing.new_write(tx).sink_from_err::<bincode::Error>();
        Link {
            rx: ReadBincode::new(rx),
            tx: WriteBincode::new(tx),
        }
    }

    /// Poll for the next inbound value. `Ready(None)` and `Err` both
    /// mean the connection is gone.
    pub fn poll_recv(&mut self) -> Result<Async<Option<R>>, ()> {
        self.rx.poll().map_err(|_| ())
    }

    /// Queue an outbound value. Delivery is best-effort: a value the
    /// transport cannot take right now is dropped, like a lost datagram.
    pub fn send(&mut self, message: T) -> Result<(), ()> {
        self.tx.start_send(message)
            .map(|_| ())
            .map_err(|_| ())
    }

    /// Drive queued values onto the wire.
    pub fn flush(&mut self) -> Result<Async<()>, ()> {
        self.tx.poll_complete().map_err(|_| ())
    }
}
