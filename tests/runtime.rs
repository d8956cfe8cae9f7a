use std::cell::RefCell;
use std::fmt;
use std::net;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use corio::{run, Error, Ready, Resume, Runtime, Step};

#[derive(Debug)]
struct Boom;

impl fmt::Display for Boom {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "boom")
    }
}

impl std::error::Error for Boom {}

// A task that yields once and then finishes with 1.
fn one() -> impl FnMut(Resume) -> Step {
    let mut step = 0;
    move |_| {
        step += 1;
        match step {
            1 => Step::yield_now(),
            _ => Step::value(1i32),
        }
    }
}

// A task that yields once and then fails with Boom.
fn failing() -> impl FnMut(Resume) -> Step {
    let mut step = 0;
    move |_| {
        step += 1;
        match step {
            1 => Step::yield_now(),
            _ => Step::Failed(Error::user(Boom)),
        }
    }
}

fn tcp_pair() -> (net::TcpStream, net::TcpStream) {
    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    server.set_nonblocking(true).unwrap();
    (client, server)
}

#[test]
fn simple_return() {
    let value = run(one()).unwrap().unwrap();

    assert_eq!(*value.downcast::<i32>().unwrap(), 1);
}

#[test]
fn nested_return() {
    let mut step = 0;
    let value = run(move |resume: Resume| {
        step += 1;
        match step {
            1 => Step::child(one()),
            _ => match resume {
                Resume::Value(value) => {
                    Step::value(*value.downcast::<i32>().unwrap() + 1)
                }
                _ => panic!("expected the child's value"),
            },
        }
    })
    .unwrap()
    .unwrap();

    assert_eq!(*value.downcast::<i32>().unwrap(), 2);
}

#[test]
fn detached_task_outlives_root_return() {
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let delayed = {
        let log = log.clone();
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::sleep_for(Duration::from_millis(100)),
                _ => {
                    log.borrow_mut().push("delayed_print");
                    Step::done()
                }
            }
        }
    };

    let root = {
        let log = log.clone();
        let mut step = 0;
        let mut delayed = Some(delayed);
        move |_: Resume| {
            step += 1;
            match step {
                1 => {
                    log.borrow_mut().push("entering");
                    Step::spawn(delayed.take().unwrap())
                }
                _ => {
                    log.borrow_mut().push("exiting");
                    Step::value(true)
                }
            }
        }
    };

    let value = run(root).unwrap().unwrap();

    assert!(*value.downcast::<bool>().unwrap());
    assert_eq!(*log.borrow(), vec!["entering", "exiting", "delayed_print"]);
}

#[test]
fn sleep_lower_bound() {
    let mut started: Option<Instant> = None;
    let value = run(move |_: Resume| match started {
        None => {
            let now = Instant::now();
            started = Some(now);
            Step::sleep(now + Duration::from_millis(500))
        }
        Some(start) => Step::value(start.elapsed() >= Duration::from_millis(500)),
    })
    .unwrap()
    .unwrap();

    assert!(*value.downcast::<bool>().unwrap());
}

#[test]
fn child_failure_reaches_the_loop() {
    let mut step = 0;
    let err = run(move |resume: Resume| {
        step += 1;
        match step {
            1 => Step::child(failing()),
            _ => match resume {
                Resume::Err(err) => Step::Failed(err),
                _ => panic!("expected the child's failure"),
            },
        }
    })
    .unwrap_err();

    assert!(err.downcast_ref::<Boom>().is_some());
}

#[test]
fn child_failure_caught_in_root() {
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let root = {
        let log = log.clone();
        let mut step = 0;
        move |resume: Resume| {
            step += 1;
            match step {
                1 => Step::child(failing()),
                _ => match resume {
                    Resume::Err(err) if err.downcast_ref::<Boom>().is_some() => {
                        log.borrow_mut().push("Error in failing()");
                        Step::done()
                    }
                    _ => panic!("expected the child's failure"),
                },
            }
        }
    };

    assert!(run(root).unwrap().is_none());
    assert_eq!(*log.borrow(), vec!["Error in failing()"]);
}

#[test]
fn unknown_mask_bits_are_malformed() {
    let mut step = 0;
    let err = run(move |resume: Resume| {
        step += 1;
        match step {
            1 => Step::io_wait(0, Ready::from(0b1000_0000)),
            _ => match resume {
                Resume::Err(err) => Step::Failed(err),
                _ => panic!("expected a malformed-request failure"),
            },
        }
    })
    .unwrap_err();

    assert!(matches!(err, Error::MalformedRequest(_)));
}

#[test]
fn stale_descriptor_is_malformed() {
    // Far past any fd the process could have open.
    let mut step = 0;
    let err = run(move |resume: Resume| {
        step += 1;
        match step {
            1 => Step::io_wait(1_000_000, Ready::readable()),
            _ => match resume {
                Resume::Err(err) => Step::Failed(err),
                _ => panic!("expected a malformed-request failure"),
            },
        }
    })
    .unwrap_err();

    assert!(matches!(err, Error::MalformedRequest(_)));
}

#[test]
fn ready_queue_is_fifo() {
    let log: Rc<RefCell<Vec<char>>> = Rc::new(RefCell::new(Vec::new()));

    let yield_then_push = |log: &Rc<RefCell<Vec<char>>>, mark: char| {
        let log = log.clone();
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::yield_now(),
                _ => {
                    log.borrow_mut().push(mark);
                    Step::done()
                }
            }
        }
    };

    let root = {
        let mut a = Some(yield_then_push(&log, 'a'));
        let mut b = Some(yield_then_push(&log, 'b'));
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::spawn(a.take().unwrap()),
                2 => Step::spawn(b.take().unwrap()),
                _ => Step::done(),
            }
        }
    };

    run(root).unwrap();

    assert_eq!(*log.borrow(), vec!['a', 'b']);
}

#[test]
fn equal_deadlines_fire_in_spawn_order() {
    let log: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let deadline = Instant::now() + Duration::from_millis(50);

    let sleeper = |log: &Rc<RefCell<Vec<u8>>>, mark: u8| {
        let log = log.clone();
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::sleep(deadline),
                _ => {
                    log.borrow_mut().push(mark);
                    Step::done()
                }
            }
        }
    };

    let root = {
        let mut first = Some(sleeper(&log, 1));
        let mut second = Some(sleeper(&log, 2));
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::spawn(first.take().unwrap()),
                2 => Step::spawn(second.take().unwrap()),
                _ => Step::done(),
            }
        }
    };

    run(root).unwrap();

    assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn detached_failure_fails_the_loop_by_default() {
    let root = {
        let mut task = Some(failing());
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::spawn(task.take().unwrap()),
                _ => Step::value(true),
            }
        }
    };

    let err = run(root).unwrap_err();

    assert!(err.downcast_ref::<Boom>().is_some());
}

#[test]
fn detached_failure_swallowed_when_quiet() {
    let root = {
        let mut task = Some(failing());
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::spawn(task.take().unwrap()),
                _ => Step::value(true),
            }
        }
    };

    let value = Runtime::new()
        .quiet_failures(true)
        .run(root)
        .unwrap()
        .unwrap();

    assert!(*value.downcast::<bool>().unwrap());
}

#[test]
fn reregistering_replaces_the_waiter() {
    let (client, _server) = tcp_pair();
    let fd = client.as_raw_fd();

    let woken: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    // Parks on the descriptor and records if it ever wakes.
    let first = {
        let woken = woken.clone();
        let mut step = 0;
        move |_: Resume| {
            step += 1;
            match step {
                1 => Step::io_wait(fd, Ready::readable() | Ready::error()),
                _ => {
                    woken.borrow_mut().push("first");
                    Step::done()
                }
            }
        }
    };

    // Takes over the same descriptor; an idle TCP socket is writable at
    // once, so this task wakes immediately and the first never does.
    let root = {
        let woken = woken.clone();
        let mut parked = Some(first);
        let mut step = 0;
        move |resume: Resume| {
            step += 1;
            match step {
                1 => Step::spawn(parked.take().unwrap()),
                2 => Step::io_wait(fd, Ready::writable() | Ready::error()),
                _ => match resume {
                    Resume::Io(mask) => {
                        assert!(mask.is_writable());
                        woken.borrow_mut().push("root");
                        Step::value(true)
                    }
                    _ => panic!("expected writable readiness"),
                },
            }
        }
    };

    let value = run(root).unwrap().unwrap();

    assert!(*value.downcast::<bool>().unwrap());
    assert_eq!(*woken.borrow(), vec!["root"]);
}
