//! Line echo server on 127.0.0.1:25000.
//!
//! Try it with `nc 127.0.0.1 25000`: every line you send comes back.

use std::net;

use corio::{listen, read_until, run, write_all, BoxTask, Error, Resume, Serve, Step, Stream};

fn echo_conn(sock: net::TcpStream, addr: net::SocketAddr) -> BoxTask {
    println!("Connection from {}", addr);

    let shared = Stream::new(sock).shared();

    Box::new(move |resume: Resume| match resume {
        Resume::Err(err) => match err {
            Error::ConnectionClosed => {
                println!("Connection closed by {}", addr);
                Step::done()
            }
            err => Step::Failed(err),
        },
        Resume::Value(line) => {
            let line = *line.downcast::<Vec<u8>>().unwrap();
            Step::child(write_all(&shared, line))
        }
        _ => Step::child(read_until(&shared, "\n", 65536)),
    })
}

fn main() {
    let listener = listen("127.0.0.1:25000").expect("bind");
    println!("Listening on {}", listener.local_addr().expect("local addr"));

    let server = Serve::new(listener, |sock, addr| echo_conn(sock, addr));

    if let Err(err) = run(server) {
        eprintln!("echo server failed: {}", err);
    }
}
