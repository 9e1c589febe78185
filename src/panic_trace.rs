//! Stack capture at the point a work function panics.
//!
//! `catch_unwind` only hands back the payload once the stack is gone, so the
//! backtrace is taken by a panic hook while the panicking frames still exist.
//! The hook only records panics raised while a [`Traced`] future is being
//! polled on the same thread; every panic is still passed on to the hook that
//! was installed before.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
    static CAPTURED: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ARMED.with(Cell::get) {
                let stack = Backtrace::force_capture().to_string();
                CAPTURED.with(|slot| *slot.borrow_mut() = Some(stack));
            }
            previous(info);
        }));
    });
}

/// Polls the wrapped future with stack capture enabled.
pub(crate) struct Traced<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Traced<F> {
    pub(crate) fn new(inner: F) -> Self {
        install_hook();
        // A stack left behind by an earlier panic on this thread is stale.
        CAPTURED.with(|slot| slot.borrow_mut().take());
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for Traced<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let _armed = Armed::set();
        self.inner.as_mut().poll(cx)
    }
}

struct Armed(bool);

impl Armed {
    fn set() -> Self {
        Self(ARMED.with(|armed| armed.replace(true)))
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|armed| armed.set(self.0));
    }
}

/// Takes the stack recorded for the last panic raised under [`Traced`] on
/// this thread.
pub(crate) fn take() -> Option<String> {
    CAPTURED.with(|slot| slot.borrow_mut().take())
}
