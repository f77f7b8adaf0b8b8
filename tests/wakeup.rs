use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use sockmux::{BackendKind, EventLoop, LoopOptions};

fn make_loop(backend: BackendKind) -> EventLoop {
    EventLoop::with_options(LoopOptions {
        backend,
        ..LoopOptions::default()
    })
    .unwrap()
}

fn wake_from_another_thread(backend: BackendKind) {
    let mut lp = make_loop(backend);
    let hits = Rc::new(Cell::new(0u32));
    {
        let hits = hits.clone();
        lp.on_wakeup(move |_| hits.set(hits.get() + 1));
    }

    let waker = lp.waker().unwrap();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        waker.wake().unwrap();
    });

    let n = lp.poll_once(Some(Duration::from_secs(5))).unwrap();
    handle.join().unwrap();

    assert!(n >= 1);
    assert_eq!(hits.get(), 1);
}

#[test]
fn wake_from_another_thread_portable() {
    wake_from_another_thread(BackendKind::Portable);
}

#[cfg(target_os = "linux")]
#[test]
fn wake_from_another_thread_epoll() {
    wake_from_another_thread(BackendKind::Epoll);
}

fn signals_coalesce(backend: BackendKind) {
    let mut lp = make_loop(backend);
    let hits = Rc::new(Cell::new(0u32));
    {
        let hits = hits.clone();
        lp.on_wakeup(move |_| hits.set(hits.get() + 1));
    }

    let waker = lp.waker().unwrap();
    waker.wake().unwrap();
    waker.wake().unwrap();
    waker.wake().unwrap();

    lp.poll_once(Some(Duration::from_millis(500))).unwrap();
    assert_eq!(hits.get(), 1);

    // nothing pending: a second poll delivers no stale wakeups
    lp.poll_once(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(hits.get(), 1);
}

#[test]
fn signals_coalesce_portable() {
    signals_coalesce(BackendKind::Portable);
}

#[cfg(target_os = "linux")]
#[test]
fn signals_coalesce_epoll() {
    signals_coalesce(BackendKind::Epoll);
}
