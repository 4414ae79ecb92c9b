extern crate logix;
use logix::client::{Client, Config};
use logix::tcp;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[test]
fn test_client() {
    let addr = IpAddr::from(Ipv4Addr::new(127, 0, 0, 1));
    let mut opts = tcp::Options::new(addr, 44818);
    opts.connection_timeout = Some(Duration::from_millis(200));
    opts.read_timeout = Duration::from_secs(2);
    opts.write_timeout = Duration::from_secs(2);

    let config = Config { init_info: false, init_tags: false, ..Config::default() };

    // nothing listens in CI; a refused connection is the expected path
    match Client::new_tcp(opts, config) {
        Ok(cl) => {
            let _ = cl.close();
        }
        Err(_e) => {}
    }
}
