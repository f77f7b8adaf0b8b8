use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use sockmux::{BackendKind, EventLoop, ListenOptions, LoopOptions, TlsContext, TlsContextOptions};

fn write_cert_pair(label: &str) -> (PathBuf, PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir();
    let id = std::process::id();
    let cert_path = dir.join(format!("sockmux-{label}-{id}-cert.pem"));
    let key_path = dir.join(format!("sockmux-{label}-{id}-key.pem"));
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

fn tls_round_trip(backend: BackendKind, label: &str) {
    let (cert_path, key_path) = write_cert_pair(label);
    let mut lp = EventLoop::with_options(LoopOptions {
        backend,
        ..LoopOptions::default()
    })
    .unwrap();
    let events = Rc::new(RefCell::new(Vec::<String>::new()));

    let server = TlsContext::create(
        &mut lp,
        TlsContextOptions {
            cert_file: Some(cert_path.clone()),
            key_file: Some(key_path.clone()),
            ..TlsContextOptions::default()
        },
    )
    .unwrap();
    {
        let events = events.clone();
        server.on_open(&mut lp, move |_, _, is_client| {
            assert!(!is_client);
            events.borrow_mut().push("server-open".into());
        });
    }
    {
        let events = events.clone();
        server.on_data(&mut lp, move |lp, s, data| {
            events
                .borrow_mut()
                .push(format!("server-data:{}", String::from_utf8_lossy(data)));
            assert_eq!(data, b"hello");
            assert_eq!(server.write(lp, s, b"world"), 5);
        });
    }
    {
        let events = events.clone();
        server.on_close(&mut lp, move |_, _| {
            events.borrow_mut().push("server-close".into());
        });
    }

    let listener = server
        .listen(&mut lp, Some("127.0.0.1"), 0, ListenOptions::default(), || {
            Box::new(())
        })
        .unwrap();
    let port = lp.local_port(listener).unwrap();

    let client = TlsContext::create(
        &mut lp,
        TlsContextOptions {
            ca_file: Some(cert_path.clone()),
            ..TlsContextOptions::default()
        },
    )
    .unwrap();
    {
        let events = events.clone();
        client.on_open(&mut lp, move |lp, s, is_client| {
            assert!(is_client);
            events.borrow_mut().push("client-open".into());
            assert_eq!(client.write(lp, s, b"hello"), 5);
        });
    }
    {
        let events = events.clone();
        client.on_data(&mut lp, move |lp, s, data| {
            events
                .borrow_mut()
                .push(format!("client-data:{}", String::from_utf8_lossy(data)));
            assert_eq!(data, b"world");
            lp.close(s);
            lp.close(listener);
        });
    }
    {
        let events = events.clone();
        client.on_close(&mut lp, move |_, _| {
            events.borrow_mut().push("client-close".into());
        });
    }

    client
        .connect(&mut lp, "127.0.0.1", port, "localhost", ())
        .unwrap();
    lp.run().unwrap();

    let events = events.borrow();
    let pos = |name: &str| {
        events
            .iter()
            .position(|e| e == name)
            .unwrap_or_else(|| panic!("missing event {name}: {events:?}"))
    };
    // plaintext is only delivered after the handshake reports open
    assert!(pos("server-open") < pos("server-data:hello"));
    assert!(pos("client-open") < pos("client-data:world"));
    assert!(events.contains(&"client-close".to_string()));

    let _ = std::fs::remove_file(&cert_path);
    let _ = std::fs::remove_file(&key_path);
}

#[test]
fn tls_round_trip_portable() {
    tls_round_trip(BackendKind::Portable, "roundtrip-portable");
}

#[cfg(target_os = "linux")]
#[test]
fn tls_round_trip_epoll() {
    tls_round_trip(BackendKind::Epoll, "roundtrip-epoll");
}

#[test]
fn verification_failure_closes_without_open() {
    let (cert_path, key_path) = write_cert_pair("badname");
    let mut lp = EventLoop::new().unwrap();
    let events = Rc::new(RefCell::new(Vec::<String>::new()));

    let server = TlsContext::create(
        &mut lp,
        TlsContextOptions {
            cert_file: Some(cert_path.clone()),
            key_file: Some(key_path.clone()),
            ..TlsContextOptions::default()
        },
    )
    .unwrap();
    {
        let events = events.clone();
        server.on_open(&mut lp, move |_, _, _| {
            events.borrow_mut().push("server-open".into());
        });
    }
    let listener = server
        .listen(&mut lp, Some("127.0.0.1"), 0, ListenOptions::default(), || {
            Box::new(())
        })
        .unwrap();
    let port = lp.local_port(listener).unwrap();

    let client = TlsContext::create(
        &mut lp,
        TlsContextOptions {
            ca_file: Some(cert_path.clone()),
            ..TlsContextOptions::default()
        },
    )
    .unwrap();
    {
        let events = events.clone();
        client.on_open(&mut lp, move |_, _, _| {
            events.borrow_mut().push("client-open".into());
        });
    }
    {
        let events = events.clone();
        client.on_close(&mut lp, move |lp, _| {
            events.borrow_mut().push("client-close".into());
            lp.close(listener);
        });
    }

    // certificate carries "localhost" only
    client
        .connect(&mut lp, "127.0.0.1", port, "example.com", ())
        .unwrap();
    lp.run().unwrap();

    let events = events.borrow();
    assert!(events.contains(&"client-close".to_string()));
    assert!(!events.contains(&"client-open".to_string()));

    let _ = std::fs::remove_file(&cert_path);
    let _ = std::fs::remove_file(&key_path);
}
