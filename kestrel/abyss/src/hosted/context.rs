//! Execution contexts backed by host threads.
//!
//! Every kernel context is a host thread that waits on its baton. Switching
//! hands the virtual processor to the next context's baton and waits on our
//! own; exactly one host thread per virtual processor runs at a time.
use super::{VirtualCpu, current, enter, freeze, leave};
use core::sync::atomic::Ordering;
use crate::platform::{Context, ContextEntry, ContextError};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Condvar, Mutex, PoisonError},
};

const HOST_STACK_SIZE: usize = 512 * 1024;

pub(super) enum Handoff {
    Run(&'static VirtualCpu),
    Discard,
}

/// Unwinds a discarded context back to the bottom of its host thread.
struct Discarded;

#[derive(Default)]
pub(super) struct Baton {
    slot: Mutex<Option<Handoff>>,
    cv: Condvar,
}

impl Baton {
    fn pass(&self, handoff: Handoff) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(slot.is_none(), "Context resumed twice.");
        *slot = Some(handoff);
        self.cv.notify_one();
    }

    fn wait(&self) -> Handoff {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(handoff) = slot.take() {
                return handoff;
            }
            slot = self.cv.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// # Safety
/// `frame` must come from [`install`] and the baton must still be alive.
unsafe fn baton<'a>(frame: usize) -> &'a Baton {
    unsafe { &*(frame as *const Baton) }
}

fn install(ctx: &mut Context) -> Arc<Baton> {
    let baton = Arc::new(Baton::default());
    ctx.frame = Arc::into_raw(baton.clone()) as usize;
    baton
}

pub(super) fn init(
    ctx: &mut Context,
    entry: ContextEntry,
    arg: usize,
    stack: usize,
) -> Result<(), ContextError> {
    let mine = install(ctx);
    let frame = ctx.frame;
    let board = current().map(|vcpu| vcpu.board);
    if let Some(board) = board {
        board.contexts.fetch_add(1, Ordering::AcqRel);
    }
    let spawned = std::thread::Builder::new()
        .name(format!("context-{arg:#x}"))
        .stack_size(stack.max(HOST_STACK_SIZE))
        .spawn(move || {
            // Keeps the baton alive for as long as this host thread lives.
            let mine = mine;
            let reclaim = || {
                if let Some(board) = board {
                    board.contexts.fetch_sub(1, Ordering::AcqRel);
                }
            };
            match mine.wait() {
                Handoff::Run(vcpu) => enter(vcpu),
                Handoff::Discard => return reclaim(),
            }
            let result = catch_unwind(AssertUnwindSafe(move || -> () { entry(arg) }));
            match result {
                Err(payload) if payload.is::<Discarded>() => return reclaim(),
                Err(payload) => {
                    if let Some(vcpu) = current() {
                        vcpu.board.fail(payload);
                    }
                }
                Ok(()) => (),
            }
            freeze()
        });
    match spawned {
        Ok(_) => Ok(()),
        Err(_) => {
            if let Some(board) = board {
                board.contexts.fetch_sub(1, Ordering::AcqRel);
            }
            // Safety: the raw reference was created just above.
            drop(unsafe { Arc::from_raw(frame as *const Baton) });
            Err(ContextError)
        }
    }
}

pub(super) fn adopt(ctx: &mut Context) {
    // The adopting host thread never goes away, neither does its baton.
    std::mem::forget(install(ctx));
}

pub(super) fn switch(prev: &mut Context, next: &Context) {
    let Some(vcpu) = current() else {
        panic!("Context switch outside of a virtual processor.");
    };
    // Safety: both batons are pinned by their host threads.
    let (mine, theirs) = unsafe { (baton(prev.frame), baton(next.frame)) };
    leave();
    theirs.pass(Handoff::Run(vcpu));
    match mine.wait() {
        Handoff::Run(vcpu) => {
            enter(vcpu);
            if vcpu.board.is_stopped() {
                freeze()
            }
        }
        // The flow left its processor for good; nothing on its stack holds
        // processor state any more.
        Handoff::Discard => std::panic::resume_unwind(Box::new(Discarded)),
    }
}

pub(super) fn discard(ctx: &mut Context) {
    if ctx.frame == 0 {
        return;
    }
    let frame = core::mem::replace(&mut ctx.frame, 0);
    // Safety: the raw reference was created by `install`.
    let baton = unsafe { Arc::from_raw(frame as *const Baton) };
    baton.pass(Handoff::Discard);
}
