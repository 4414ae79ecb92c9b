// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! This crate provides communication tools for Allen-Bradley ControlLogix
//! and CompactLogix PLC devices over EtherNet/IP
//! # Examples
//! ```no_run
//! # extern crate logix;
//! # use logix::{client::{Client, Config}, tag::PlcValue, tcp};
//! # use std::net::{IpAddr, Ipv4Addr};
//! # use std::time::Duration;
//!
//! # fn main() {
//!     let addr = IpAddr::from(Ipv4Addr::new(192, 168, 1, 10));
//!     let mut opts = tcp::Options::default_port(addr);
//!     opts.read_timeout = Duration::from_secs(2);
//!     opts.write_timeout = Duration::from_secs(2);
//!     let mut cl = match Client::new_tcp(opts, Config::default()) {
//!         Ok(cl) => cl,
//!         Err(e) => {
//!             println!("{:?}", e.to_string());
//!             return;
//!         }
//!     };
//!
//!     for tag in cl.read(&["Motor.Speed", "Counts{10}", "Word.5"]).unwrap() {
//!         println!("{}: {:?}", tag.name, tag.value);
//!     }
//!
//!     match cl.write(&[("Setpoint", PlcValue::Dint(1500))]) {
//!       Ok(tags) => println!("written: {:?}", tags),
//!       Err(e) => println!("error: {:?}", e),
//!     }
//! # }
//! ```
mod catalog;
pub mod client;
mod codec;
pub mod constant;
pub mod epath;
pub mod error;
pub mod packet;
pub mod tag;
pub mod tcp;
pub mod transport;
