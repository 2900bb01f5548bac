//! Interactive smoke-test tool: performs one `GET_PAIR` round trip against a running broker and
//! reports whether a `SET_PAIR` endpoint came back. Kept alongside the main crates the way this
//! codebase keeps ad hoc net probes in `util` rather than folding them into a test suite.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use broker_core::frame::Mode;
use clap::{App, Arg};

fn parse_mode(raw: &str) -> Mode {
    match raw {
        "none" => Mode::None,
        "client" => Mode::Client,
        "server" => Mode::Server,
        other => panic!("unknown mode `{}` (expected none, client, or server)", other),
    }
}

fn main() {
    let matches = App::new("Rendezvous Probe")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Performs one GET_PAIR round trip against a running rendezvous broker.")
        .arg(
            Arg::with_name("SOCKET_PATH")
                .help("Path to the broker's listening socket")
                .required(true),
        )
        .arg(
            Arg::with_name("KEY")
                .help("Rendezvous key to present")
                .required(true),
        )
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .takes_value(true)
                .default_value("none")
                .help("Role to declare: none, client, or server"),
        )
        .arg(
            Arg::with_name("ping")
                .long("ping")
                .help("After matching, write \"ping\" on the endpoint and print what comes back"),
        )
        .get_matches();

    let socket_path = PathBuf::from(matches.value_of("SOCKET_PATH").unwrap());
    let key = matches.value_of("KEY").unwrap().as_bytes();
    let mode = parse_mode(matches.value_of("mode").unwrap());

    println!("connecting to {} with mode={:?} key={:?}", socket_path.display(), mode, String::from_utf8_lossy(key));

    let mut endpoint = broker_client::request_pair(&socket_path, mode, key).expect("rendezvous request failed");
    println!("matched; received a connected endpoint");

    if matches.is_present("ping") {
        endpoint
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set_read_timeout");
        endpoint.write_all(b"ping").expect("write to endpoint");
        let mut buf = [0u8; 4];
        match endpoint.read_exact(&mut buf) {
            Ok(()) => println!("echoed back: {:?}", String::from_utf8_lossy(&buf)),
            Err(err) => println!("no echo received: {}", err),
        }
    }
}
