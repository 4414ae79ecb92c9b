// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Transport definition for PLC

use super::error::Error;

/// an abstract framed exchange used by the client to talk to the target
/// ## How can I implement `Transport`?
///
/// Types that are [`Transport`] exchange whole encapsulated frames: a
/// 24 byte header whose length field at offset 2 gives the payload size,
/// followed by the payload. `receive` must return exactly one frame.
pub trait Transport {
    /// send one complete frame to the target.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;
    /// receive one complete frame, header included.
    fn receive(&mut self) -> Result<Vec<u8>, Error>;
    /// tear the underlying channel down.
    fn close(&mut self) -> Result<(), Error>;
}
