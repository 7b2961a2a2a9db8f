use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use anyhow::Error;
use tracing_test::traced_test;
use weft::TimerHandle;

#[test]
#[traced_test]
fn timers_fire_in_order_before_exit() -> Result<(), Error> {
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        weft_mio::run_event_loop(move |_rt, cx| {
            for (name, delay) in [("slow", 20), ("fast", 1), ("medium", 5)] {
                let log = log.clone();
                cx.after(Duration::from_millis(delay), move || log.borrow_mut().push(name));
            }

            let cancelled = cx.after(Duration::from_millis(2), || panic!("cancelled timer fired"));
            cancelled.cancel();

            let log = log.clone();
            cx.on_exit(move || log.borrow_mut().push("exit"));

            Ok(())
        })?;
    }

    assert_eq!(*log.borrow(), ["fast", "medium", "slow", "exit"]);

    Ok(())
}

#[test]
#[traced_test]
fn empty_loop_exits_immediately() -> Result<(), Error> {
    let exits = Rc::new(RefCell::new(0));

    {
        let exits = exits.clone();
        weft_mio::run_event_loop(move |_rt, cx| {
            cx.on_exit(move || *exits.borrow_mut() += 1);
            Ok(())
        })?;
    }

    assert_eq!(*exits.borrow(), 1);

    Ok(())
}

#[test]
#[traced_test]
fn repeating_timer_runs_until_cancelled() -> Result<(), Error> {
    let ticks = Rc::new(Cell::new(0));
    let at_exit = Rc::new(Cell::new(None));

    {
        let ticks = ticks.clone();
        let at_exit = at_exit.clone();
        weft_mio::run_event_loop(move |_rt, cx| {
            let handle: Rc<RefCell<Option<TimerHandle>>> = Rc::default();

            let timer = {
                let ticks = ticks.clone();
                let handle = handle.clone();
                cx.every(Duration::from_millis(1), move || {
                    ticks.set(ticks.get() + 1);

                    if ticks.get() == 3 {
                        if let Some(handle) = handle.borrow().as_ref() {
                            assert!(handle.cancel());
                        }
                    }
                })
            };
            *handle.borrow_mut() = Some(timer);

            cx.on_exit(move || at_exit.set(Some(ticks.get())));

            Ok(())
        })?;
    }

    assert_eq!(ticks.get(), 3);
    assert_eq!(at_exit.get(), Some(3));

    Ok(())
}
