//! Cleanup scope stacks and time-slicing, both detached and bound to a
//! running task.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use cooptask::{
    start, start_fn, Awaitable, Dispatch, NowThen, Result, Step, TaskCx, UsageError, Value,
};

use common::{as_str, init_tracing};

#[test]
fn nested_scopes_unwind_innermost_first() {
    init_tracing();
    let d = Dispatch::new();
    let nt = NowThen::detached(&d);
    let log = Rc::new(RefCell::new(Vec::new()));

    let push = |tag: &'static str| {
        let log = log.clone();
        move || {
            log.borrow_mut().push(tag);
            Ok(())
        }
    };

    nt.defer(push("root")).unwrap();
    nt.enter();
    nt.defer(push("outer-1")).unwrap();
    nt.defer(push("outer-2")).unwrap();
    nt.enter();
    nt.defer(push("inner")).unwrap();

    nt.leave().unwrap();
    assert_eq!(*log.borrow(), vec!["inner"]);
    nt.leave().unwrap();
    assert_eq!(*log.borrow(), vec!["inner", "outer-2", "outer-1"]);
    nt.leave().unwrap();
    assert_eq!(*log.borrow(), vec!["inner", "outer-2", "outer-1", "root"]);
    assert_eq!(nt.depth(), 0);
}

#[test]
fn recover_drains_without_closing_the_scope() {
    init_tracing();
    let d = Dispatch::new();
    let nt = NowThen::detached(&d);
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    nt.defer(move || {
        l.borrow_mut().push("retry cleanup");
        Ok(())
    })
    .unwrap();

    nt.recover().unwrap();
    assert_eq!(*log.borrow(), vec!["retry cleanup"]);
    assert_eq!(nt.depth(), 1);

    // The scope is still usable after a recover.
    let l = log.clone();
    nt.defer(move || {
        l.borrow_mut().push("second attempt");
        Ok(())
    })
    .unwrap();
    nt.leave().unwrap();
    assert_eq!(*log.borrow(), vec!["retry cleanup", "second attempt"]);
}

#[test]
fn cleanup_error_surfaces_inside_a_task() {
    init_tracing();
    let d = Dispatch::new();
    let released = Rc::new(RefCell::new(Vec::new()));
    let r = released.clone();
    let t = start_fn(&d, move |cx| {
        let nt = NowThen::new(cx);
        let r1 = r.clone();
        nt.defer(move || {
            r1.borrow_mut().push("lock");
            Ok(())
        })?;
        nt.defer(|| Err(cooptask::Error::user("release failed")))?;
        let r2 = r.clone();
        nt.defer(move || {
            r2.borrow_mut().push("file");
            Ok(())
        })?;
        nt.leave()?;
        Ok(Value::null())
    });
    d.run_until_quiescent();

    assert_eq!(t.error().unwrap().message(), "release failed");
    // Both healthy cleanups still ran, newest first.
    assert_eq!(*released.borrow(), vec!["file", "lock"]);
}

#[test]
fn tokens_hand_off_between_producer_and_consumer() {
    init_tracing();
    let d = Dispatch::new();
    let nt = NowThen::detached(&d);
    let producer_nt = nt.clone();

    let consumer = start(&d, move |cx: &TaskCx, input: Result<Value>| match input {
        Ok(v) if v.is_null() => {
            let token = match nt.token() {
                Ok(t) => t,
                Err(e) => return Step::Done(Err(e)),
            };
            cx.wait_on(&token).unwrap();
            Step::Suspended
        }
        other => Step::Done(other),
    });
    let producer = start_fn(&d, move |_cx| {
        let token = producer_nt.take_token()?;
        token.resolve(Value::new("handed off"));
        Ok(Value::null())
    });
    d.run_until_quiescent();

    assert!(producer.error().is_none());
    assert_eq!(as_str(&consumer.result().unwrap()), "handed off");
}

#[test]
fn take_token_without_one_is_a_usage_error() {
    init_tracing();
    let d = Dispatch::new();
    let nt = NowThen::detached(&d);
    let err = nt.take_token().unwrap_err();
    assert_eq!(err.usage_violation(), Some(UsageError::NoPendingToken));
}

#[test]
fn detached_timeslice_tracks_the_virtual_clock() {
    init_tracing();
    let d = Dispatch::new();
    let nt = NowThen::detached(&d);
    assert!(!nt.timeslice_used_up(Duration::from_millis(5)));

    d.schedule_after(Duration::from_millis(10), || {});
    d.run_until_quiescent();

    assert!(nt.timeslice_used_up(Duration::from_millis(5)));
    assert!(!nt.timeslice_used_up(Duration::from_millis(20)));
}

#[test]
fn resumption_re_anchors_the_slice_budget() {
    init_tracing();
    let d = Dispatch::new();
    let budget = Duration::from_millis(5);
    let over_budget = Rc::new(RefCell::new(Vec::new()));
    let o = over_budget.clone();
    let dispatch = d.clone();

    let shared: Rc<RefCell<Option<NowThen>>> = Rc::new(RefCell::new(None));
    let t = start(&d, move |cx: &TaskCx, input: Result<Value>| {
        if let Err(e) = input {
            return Step::Done(Err(e));
        }
        let mut slot = shared.borrow_mut();
        match slot.as_ref() {
            None => {
                let nt = NowThen::new(cx);
                o.borrow_mut().push(nt.timeslice_used_up(budget));
                // Suspend across a 50ms timer, far past the budget.
                let gate = cooptask::Awaiter::new(&dispatch);
                let settle = gate.clone();
                dispatch.schedule_after(Duration::from_millis(50), move || {
                    settle.resolve(Value::null());
                });
                cx.wait_on(&gate).unwrap();
                *slot = Some(nt);
                Step::Suspended
            }
            Some(nt) => {
                // The resumption re-anchored the slice, so the budget is
                // fresh even though 50ms of virtual time passed.
                o.borrow_mut().push(nt.timeslice_used_up(budget));
                Step::Done(Ok(Value::null()))
            }
        }
    });

    d.run_until_quiescent();
    assert!(t.is_done());
    assert_eq!(d.now().duration_since(cooptask::Time::ZERO), Duration::from_millis(50));
    assert_eq!(*over_budget.borrow(), vec![false, false]);
}

#[test]
fn yield_awaiter_settles_on_the_next_turn() {
    init_tracing();
    let d = Dispatch::new();
    let nt = NowThen::detached(&d);
    let y = nt.timeslice_yield();
    assert!(!y.is_done());
    d.run_until_quiescent();
    assert!(y.is_done());
    assert!(y.result().unwrap().is_null());
}
