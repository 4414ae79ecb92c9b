// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! TCP transport implementation

use super::codec;
use super::constant::{DEFAULT_PORT, ENCAP_HEADER_LEN};
use super::error::Error;
use super::transport::Transport as PackTrait;
use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};
use std::time::Duration;

/// Default TCP timeout
pub const TIMEOUT: Duration = Duration::from_secs(10);
/// A frame larger than this is a protocol violation, not a big transfer.
pub const MAX_FRAME_LENGTH: usize = 0x10000;

pub struct Transport {
    options: Options,
    stream: TcpStream,
}

/// a set of options for the TCP connection
#[derive(Debug, Clone)]
pub struct Options {
    pub connection_timeout: Option<Duration>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    address: String,
}

impl Options {
    pub fn new(address: IpAddr, port: u16) -> Options {
        Options {
            connection_timeout: None,
            read_timeout: TIMEOUT,
            write_timeout: TIMEOUT,
            address: format!("{}:{}", address, port),
        }
    }

    /// The well known EtherNet/IP port 44818.
    pub fn default_port(address: IpAddr) -> Options {
        Options::new(address, DEFAULT_PORT)
    }
}

impl Transport {
    pub fn connect(options: Options) -> Result<Transport, Error> {
        let stream = match options.connection_timeout {
            Some(timeout) => {
                // Trying connecting with timeout
                match options.address.parse::<std::net::SocketAddr>() {
                    Ok(socket_address) => TcpStream::connect_timeout(&socket_address, timeout)?,
                    Err(e) => return Err(Error::Connect(e.to_string())),
                }
            }
            None => {
                // Trying connecting with no timeout defined
                TcpStream::connect(&options.address)?
            }
        };

        stream.set_read_timeout(Some(options.read_timeout))?;
        stream.set_write_timeout(Some(options.write_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Transport { options, stream })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

impl PackTrait for Transport {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.stream.write_all(frame)?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, Error> {
        let mut header = [0u8; ENCAP_HEADER_LEN];
        self.stream.read_exact(&mut header)?;

        let length = codec::get_u16(&header, 2)? as usize;
        if length > MAX_FRAME_LENGTH {
            return Err(Error::Decode(format!("frame length {} out of range", length)));
        }

        let mut frame = vec![0u8; ENCAP_HEADER_LEN + length];
        frame[..ENCAP_HEADER_LEN].copy_from_slice(&header);
        self.stream.read_exact(&mut frame[ENCAP_HEADER_LEN..])?;
        Ok(frame)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}
