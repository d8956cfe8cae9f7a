use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{self, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use corio::{
    read_bytes, run, write_all, Connect, Error, Ready, Resume, Step, Stream, Task,
};

type Log = Rc<RefCell<Vec<String>>>;

// One-shot echo server: accepts a single connection, reads up to 1024
// bytes, echoes them back and closes, deregistering each descriptor
// before letting go of it.
struct OneshotServer {
    listener: Option<net::TcpListener>,
    conn: Option<net::TcpStream>,
    data: Vec<u8>,
    state: ServerState,
    log: Log,
}

enum ServerState {
    Start,
    Accepting,
    Accepted,
    Reading,
    Writing,
    Closing,
}

impl OneshotServer {
    fn new(listener: net::TcpListener, log: Log) -> OneshotServer {
        OneshotServer {
            listener: Some(listener),
            conn: None,
            data: Vec::new(),
            state: ServerState::Start,
            log,
        }
    }

    fn listener_fd(&self) -> i32 {
        self.listener.as_ref().unwrap().as_raw_fd()
    }

    fn conn_fd(&self) -> i32 {
        self.conn.as_ref().unwrap().as_raw_fd()
    }
}

impl Task for OneshotServer {
    fn resume(&mut self, input: Resume) -> Step {
        if let Resume::Err(err) = input {
            return Step::Failed(err);
        }

        match self.state {
            ServerState::Start => {
                self.state = ServerState::Accepting;
                Step::io_wait(self.listener_fd(), Ready::readable() | Ready::error())
            }
            ServerState::Accepting => {
                let (conn, _) = self.listener.as_ref().unwrap().accept().unwrap();
                conn.set_nonblocking(true).unwrap();
                self.conn = Some(conn);
                self.log.borrow_mut().push("Connection".to_string());
                self.state = ServerState::Accepted;
                Step::io_drop(self.listener_fd())
            }
            ServerState::Accepted => {
                self.listener = None;
                self.state = ServerState::Reading;
                Step::io_wait(self.conn_fd(), Ready::readable() | Ready::error())
            }
            ServerState::Reading => {
                let mut buf = [0u8; 1024];
                match self.conn.as_mut().unwrap().read(&mut buf) {
                    Ok(n) => {
                        self.data = buf[..n].to_vec();
                        self.log.borrow_mut().push(format!(
                            "Request: {}",
                            String::from_utf8_lossy(&self.data)
                        ));
                        self.state = ServerState::Writing;
                        Step::io_wait(self.conn_fd(), Ready::writable() | Ready::error())
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        Step::io_wait(self.conn_fd(), Ready::readable() | Ready::error())
                    }
                    Err(err) => Step::Failed(Error::Io(err)),
                }
            }
            ServerState::Writing => {
                match self.conn.as_mut().unwrap().write(&self.data) {
                    Ok(_) => {
                        self.state = ServerState::Closing;
                        Step::io_drop(self.conn_fd())
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        Step::io_wait(self.conn_fd(), Ready::writable() | Ready::error())
                    }
                    Err(err) => Step::Failed(Error::Io(err)),
                }
            }
            ServerState::Closing => {
                self.conn = None;
                Step::done()
            }
        }
    }
}

// Client: connect, send "ping", read the 4-byte reply.
fn client(addr: SocketAddr, log: Log) -> impl FnMut(Resume) -> Step {
    let mut step = 0;
    let mut stream = None;
    move |resume: Resume| {
        let resume = match resume {
            Resume::Err(err) => return Step::Failed(err),
            other => other,
        };

        step += 1;
        match step {
            1 => Step::child(Connect::new(addr)),
            2 => {
                let sock = match resume {
                    Resume::Value(value) => *value.downcast::<net::TcpStream>().unwrap(),
                    _ => panic!("expected the connected stream"),
                };
                let shared = Stream::new(sock).shared();
                let write = write_all(&shared, "ping");
                stream = Some(shared);
                Step::child(write)
            }
            3 => Step::child(read_bytes(stream.as_ref().unwrap(), 4)),
            _ => {
                let reply = match resume {
                    Resume::Value(value) => *value.downcast::<Vec<u8>>().unwrap(),
                    _ => panic!("expected the reply bytes"),
                };
                log.borrow_mut()
                    .push(format!("Reply: {}", String::from_utf8_lossy(&reply)));
                Step::done()
            }
        }
    }
}

#[test]
fn oneshot_echo() {
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    let listener = corio::listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let root = {
        let mut server = Some(OneshotServer::new(listener, log.clone()));
        let mut client = Some(client(addr, log.clone()));
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::spawn(server.take().unwrap()),
                2 => Step::child(client.take().unwrap()),
                _ => Step::done(),
            }
        }
    };

    run(root).unwrap();

    assert_eq!(
        *log.borrow(),
        vec!["Connection", "Request: ping", "Reply: ping"]
    );
}
