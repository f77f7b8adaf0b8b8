use std::cell::{Cell, RefCell};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};
use std::rc::Rc;

use sockmux::{BackendKind, EventLoop, ListenOptions, LoopOptions};

const PAYLOAD_LEN: usize = 1 << 20;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

fn shrink_send_buffer(fd: RawFd) {
    let socket = ManuallyDrop::new(unsafe { socket2::Socket::from_raw_fd(fd) });
    socket.set_send_buffer_size(16 * 1024).unwrap();
}

fn shrink_recv_buffer(fd: RawFd) {
    let socket = ManuallyDrop::new(unsafe { socket2::Socket::from_raw_fd(fd) });
    socket.set_recv_buffer_size(16 * 1024).unwrap();
}

fn short_write_resumes_from_offset(backend: BackendKind) {
    let mut lp = EventLoop::with_options(LoopOptions {
        backend,
        ..LoopOptions::default()
    })
    .unwrap();
    let data = Rc::new(payload());
    let received = Rc::new(RefCell::new(Vec::<u8>::new()));
    let first_write = Rc::new(Cell::new(usize::MAX));
    let sent = Rc::new(Cell::new(0usize));
    let writable_fires = Rc::new(Cell::new(0u32));

    let server = lp.create_context(());
    {
        let received = received.clone();
        lp.on_data(server, move |_, _, d| {
            received.borrow_mut().extend_from_slice(d);
        });
    }
    let listener = lp
        .listen(server, Some("127.0.0.1"), 0, ListenOptions::default(), || {
            Box::new(())
        })
        .unwrap();
    let port = lp.local_port(listener).unwrap();
    // accepted sockets inherit the listener's receive buffer
    shrink_recv_buffer(lp.socket_fd(listener).unwrap());
    lp.on_close(server, move |lp, _| lp.close(listener));

    let client = lp.create_context(());
    {
        let data = data.clone();
        let first_write = first_write.clone();
        let sent = sent.clone();
        lp.on_open(client, move |lp, s, _| {
            shrink_send_buffer(lp.socket_fd(s).unwrap());
            let n = lp.write(s, &data, false);
            first_write.set(n);
            sent.set(n);
            if n == data.len() {
                lp.shutdown(s);
            }
        });
    }
    {
        let data = data.clone();
        let sent = sent.clone();
        let writable_fires = writable_fires.clone();
        lp.on_writable(client, move |lp, s| {
            writable_fires.set(writable_fires.get() + 1);
            let n = lp.write(s, &data[sent.get()..], false);
            sent.set(sent.get() + n);
            if sent.get() == data.len() {
                lp.shutdown(s);
            }
        });
    }

    lp.connect(client, "127.0.0.1", port, ()).unwrap();
    lp.run().unwrap();

    // the shrunken buffers must have forced at least one short write
    assert!(
        first_write.get() < data.len(),
        "first write took all {} bytes",
        data.len()
    );
    assert!(writable_fires.get() >= 1);
    assert_eq!(sent.get(), data.len());
    assert_eq!(*received.borrow(), *data);
}

#[test]
fn short_write_resumes_portable() {
    short_write_resumes_from_offset(BackendKind::Portable);
}

#[cfg(target_os = "linux")]
#[test]
fn short_write_resumes_epoll() {
    short_write_resumes_from_offset(BackendKind::Epoll);
}

#[test]
fn corked_writes_are_released_by_flush() {
    let mut lp = EventLoop::new().unwrap();
    let received = Rc::new(RefCell::new(Vec::<u8>::new()));

    let server = lp.create_context(());
    let listener = lp
        .listen(server, Some("127.0.0.1"), 0, ListenOptions::default(), || {
            Box::new(())
        })
        .unwrap();
    let port = lp.local_port(listener).unwrap();
    {
        let received = received.clone();
        lp.on_data(server, move |lp, s, d| {
            received.borrow_mut().extend_from_slice(d);
            if received.borrow().len() == 5 {
                lp.close(s);
                lp.close(listener);
            }
        });
    }

    let client = lp.create_context(());
    lp.on_open(client, move |lp, s, _| {
        assert_eq!(lp.write(s, b"he", true), 2);
        assert_eq!(lp.write(s, b"llo", true), 3);
        lp.flush(s);
    });

    lp.connect(client, "127.0.0.1", port, ()).unwrap();
    lp.run().unwrap();

    assert_eq!(&*received.borrow(), b"hello");
}
