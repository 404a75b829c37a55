//! The task resumption protocol end to end: deferred starts, stored
//! outcomes, one-shot resume handles, cooperative cancellation, and the
//! per-task event bus.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cooptask::{
    start, start_fn, start_method, Awaitable, Awaiter, Callback, Dispatch, ErrorKind, Result, Step,
    TaskCx, UsageError, Value,
};

use common::{as_i32, as_str, init_tracing};

#[test]
fn task_body_runs_on_a_later_turn() {
    init_tracing();
    let d = Dispatch::new();
    let ran = Rc::new(Cell::new(false));
    let r = ran.clone();
    let t = start_fn(&d, move |_| {
        r.set(true);
        Ok(Value::null())
    });
    // Starting must not run any user code synchronously.
    assert!(!ran.get());
    assert!(!t.is_done());
    d.run_until_quiescent();
    assert!(ran.get());
    assert!(t.is_done());
}

#[test]
fn completion_outcome_is_stored_and_replayed() {
    init_tracing();
    let d = Dispatch::new();
    let ok = start_fn(&d, |_| Ok(Value::new(11_i32)));
    let bad = start_fn(&d, |_| Err(cooptask::Error::user("went wrong")));
    d.run_until_quiescent();

    assert_eq!(as_i32(&ok.result().unwrap()), 11);
    assert_eq!(bad.error().unwrap().message(), "went wrong");

    // A subscriber arriving after completion still gets the outcome.
    let seen = Rc::new(RefCell::new(None));
    let s = seen.clone();
    ok.subscribe(Callback::new(move |outcome| {
        *s.borrow_mut() = Some(outcome);
    }))
    .unwrap();
    d.run_until_quiescent();
    let outcome = seen.borrow_mut().take().unwrap().unwrap();
    assert_eq!(as_i32(&outcome), 11);
}

#[test]
fn multi_slice_body_resumes_through_an_awaiter() {
    init_tracing();
    let d = Dispatch::new();
    let gate = Awaiter::new(&d);
    let gate_for_body = gate.clone();
    let stage = Rc::new(Cell::new(0_u32));
    let stage_for_body = stage.clone();

    let t = start(&d, move |cx: &TaskCx, input: Result<Value>| {
        let input = match input {
            Ok(v) => v,
            Err(e) => return Step::Done(Err(e)),
        };
        match stage_for_body.replace(stage_for_body.get() + 1) {
            0 => {
                if let Err(e) = cx.wait_on(&gate_for_body) {
                    return Step::Done(Err(e));
                }
                Step::Suspended
            }
            _ => Step::Done(Ok(Value::new(as_i32(&input) * 2))),
        }
    });

    d.run_until_quiescent();
    assert!(!t.is_done());
    gate.resolve(Value::new(21_i32));
    d.run_until_quiescent();
    assert_eq!(as_i32(&t.result().unwrap()), 42);
    assert_eq!(stage.get(), 2);
}

#[test]
fn errors_pick_up_task_context_when_crossing_boundaries() {
    init_tracing();
    let d = Dispatch::new();
    let gate = Awaiter::new(&d);
    let gate_for_body = gate.clone();
    let t = start(&d, move |cx: &TaskCx, input: Result<Value>| match input {
        Ok(v) if v.is_null() => {
            cx.wait_on(&gate_for_body).unwrap();
            Step::Suspended
        }
        other => Step::Done(other),
    });
    d.run_until_quiescent();
    gate.reject(cooptask::Error::user("upstream failed"));
    d.run_until_quiescent();

    let err = t.error().unwrap();
    assert_eq!(err.message(), "upstream failed");
    assert_eq!(err.context().len(), 1);
    assert!(err.context()[0].starts_with("resumed task-"));
}

#[test]
fn cancellation_delivers_message_and_runs_hook() {
    init_tracing();
    let d = Dispatch::new();
    let hook_msg = Rc::new(RefCell::new(None::<String>));
    let h = hook_msg.clone();

    let t = start(&d, move |cx: &TaskCx, input: Result<Value>| match input {
        Ok(v) if v.is_null() => {
            let h = h.clone();
            cx.on_cancel(move |msg| *h.borrow_mut() = Some(msg.to_string()));
            Step::Suspended
        }
        other => Step::Done(other),
    });
    d.run_until_quiescent();
    t.cancel("deadline passed");
    d.run_until_quiescent();

    let err = t.error().unwrap();
    assert!(err.is_canceled());
    assert_eq!(err.cancel_message(), Some("deadline passed"));
    assert_eq!(hook_msg.borrow().as_deref(), Some("deadline passed"));
}

#[test]
fn body_can_trap_cancellation_and_finish_cleanly() {
    init_tracing();
    let d = Dispatch::new();
    let t = start(&d, |_cx: &TaskCx, input: Result<Value>| match input {
        Ok(v) if v.is_null() => Step::Suspended,
        Ok(v) => Step::Done(Ok(v)),
        Err(e) if e.is_canceled() => Step::Done(Ok(Value::new("wound down"))),
        Err(e) => Step::Done(Err(e)),
    });
    d.run_until_quiescent();
    t.cancel("stop now");
    d.run_until_quiescent();
    assert!(t.error().is_none());
    assert_eq!(as_str(&t.result().unwrap()), "wound down");
}

#[test]
fn cancel_before_first_slice_still_runs_the_body() {
    init_tracing();
    let d = Dispatch::new();
    let ran = Rc::new(Cell::new(false));
    let r = ran.clone();
    let t = start_fn(&d, move |_| {
        r.set(true);
        Ok(Value::new(1_i32))
    });
    t.cancel("never mind");
    d.run_until_quiescent();
    // A single-slice body completes; the cancellation arrives too late.
    assert!(ran.get());
    assert_eq!(as_i32(&t.result().unwrap()), 1);
}

#[test]
fn checkpoint_surfaces_cancellation_mid_slice() {
    init_tracing();
    let d = Dispatch::new();
    let progressed = Rc::new(Cell::new(false));
    let p = progressed.clone();

    // Cancellation requested while the slice is running is only observable
    // through an explicit check; the driver cannot interrupt the body.
    let t = start_fn(&d, move |cx| {
        cx.handle().cancel("shutting down");
        cx.checkpoint()?;
        p.set(true);
        Ok(Value::null())
    });
    d.run_until_quiescent();

    let err = t.error().unwrap();
    assert!(err.is_canceled());
    assert_eq!(err.cancel_message(), Some("shutting down"));
    assert!(!progressed.get());
}

#[test]
fn stale_resume_handle_loses_to_the_first_resumption() {
    init_tracing();
    let d = Dispatch::new();
    let handles = Rc::new(RefCell::new(Vec::new()));
    let h = handles.clone();
    let t = start(&d, move |cx: &TaskCx, input: Result<Value>| match input {
        Ok(v) if v.is_null() => {
            h.borrow_mut().push(cx.resume_handle());
            h.borrow_mut().push(cx.resume_handle());
            Step::Suspended
        }
        other => Step::Done(other),
    });
    d.run_until_quiescent();

    let (first, second) = {
        let mut hs = handles.borrow_mut();
        let second = hs.pop().unwrap();
        let first = hs.pop().unwrap();
        (first, second)
    };
    second.resolve(Value::new(2_i32));
    first.resolve(Value::new(1_i32));
    d.run_until_quiescent();
    // The handle fired first wins; the sibling is stale.
    assert_eq!(as_i32(&t.result().unwrap()), 2);
}

#[test]
fn awaiting_your_own_completion_is_a_usage_error() {
    init_tracing();
    let d = Dispatch::new();
    let t = start_fn(&d, |cx| {
        let own = cx.handle();
        cx.wait_on(&own)?;
        Ok(Value::null())
    });
    d.run_until_quiescent();
    let err = t.error().unwrap();
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(err.usage_violation(), Some(UsageError::SelfAwait));
}

#[test]
fn method_bodies_share_their_receiver() {
    init_tracing();
    struct Counter {
        hits: Cell<i32>,
    }
    let d = Dispatch::new();
    let counter = Rc::new(Counter { hits: Cell::new(0) });
    let a = start_method(&d, counter.clone(), |c, _cx| {
        c.hits.set(c.hits.get() + 1);
        Ok(Value::new(c.hits.get()))
    });
    let b = start_method(&d, counter.clone(), |c, _cx| {
        c.hits.set(c.hits.get() + 1);
        Ok(Value::new(c.hits.get()))
    });
    d.run_until_quiescent();
    assert_eq!(as_i32(&a.result().unwrap()), 1);
    assert_eq!(as_i32(&b.result().unwrap()), 2);
    assert_eq!(counter.hits.get(), 2);
}

#[test]
fn event_bus_delivers_deferred_and_deduplicates() {
    init_tracing();
    let d = Dispatch::new();
    let t = start(&d, |_cx: &TaskCx, _input: Result<Value>| Step::Suspended);

    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    let listener: Rc<dyn Fn(&[Value])> = Rc::new(move |args| {
        l.borrow_mut().push(as_i32(&args[0]));
    });
    t.on("progress", listener.clone());
    t.on("progress", listener.clone());

    t.emit("progress", vec![Value::new(1_i32)]);
    assert!(log.borrow().is_empty());
    d.run_until_quiescent();
    assert_eq!(*log.borrow(), vec![1]);

    t.remove_listener("progress", &listener);
    t.emit("progress", vec![Value::new(2_i32)]);
    d.run_until_quiescent();
    assert_eq!(*log.borrow(), vec![1]);
}

#[test]
fn once_listeners_fire_a_single_time() {
    init_tracing();
    let d = Dispatch::new();
    let t = start(&d, |_cx: &TaskCx, _input: Result<Value>| Step::Suspended);

    let hits = Rc::new(Cell::new(0));
    let h = hits.clone();
    let listener: Rc<dyn Fn(&[Value])> = Rc::new(move |_| h.set(h.get() + 1));
    t.once("tick", listener);

    t.emit("tick", Vec::new());
    t.emit("tick", Vec::new());
    d.run_until_quiescent();
    t.emit("tick", Vec::new());
    d.run_until_quiescent();
    assert_eq!(hits.get(), 1);
}

#[test]
fn remove_all_listeners_clears_a_channel() {
    init_tracing();
    let d = Dispatch::new();
    let t = start(&d, |_cx: &TaskCx, _input: Result<Value>| Step::Suspended);

    let hits = Rc::new(Cell::new(0));
    let h1 = hits.clone();
    let h2 = hits.clone();
    t.on("a", Rc::new(move |_: &[Value]| h1.set(h1.get() + 1)));
    t.on("b", Rc::new(move |_: &[Value]| h2.set(h2.get() + 10)));
    t.remove_all_listeners("a");
    t.emit("a", Vec::new());
    t.emit("b", Vec::new());
    d.run_until_quiescent();
    assert_eq!(hits.get(), 10);
}
