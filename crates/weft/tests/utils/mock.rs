use std::{
    rc::Rc,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use anyhow::{bail, Error};
use weft::{Actor, Mailbox, Meta, Runtime, Sender, Signal};

pub fn given_mock_actor(rt: &mut Runtime) -> ActorInfo {
    given_actor(rt, "mock-actor", false)
}

pub fn given_fail_actor(rt: &mut Runtime) -> ActorInfo {
    given_actor(rt, "fail-actor", true)
}

fn given_actor(rt: &mut Runtime, name: &'static str, fail: bool) -> ActorInfo {
    let signal = Signal::default();
    let mailbox = Mailbox::new(signal.clone());
    let sender = mailbox.sender();

    let instance = MockActor {
        mailbox,
        count: Rc::default(),
        dropped: Rc::default(),
        fail,
    };

    let count = instance.count.clone();
    let dropped = instance.dropped.clone();
    rt.insert(name, &signal, instance);

    ActorInfo {
        sender,
        count,
        dropped,
    }
}

pub struct ActorInfo {
    pub sender: Sender<()>,
    pub count: Rc<AtomicUsize>,
    pub dropped: Rc<AtomicBool>,
}

struct MockActor {
    mailbox: Mailbox<()>,
    count: Rc<AtomicUsize>,
    dropped: Rc<AtomicBool>,
    fail: bool,
}

impl Actor for MockActor {
    fn process(&mut self, _rt: &mut Runtime, meta: &mut Meta) -> Result<(), Error> {
        if self.fail {
            bail!("mock intentional fail");
        }

        while self.mailbox.recv().is_some() {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        // Stop after handling just one set of messages
        meta.set_stop();

        Ok(())
    }
}

impl Drop for MockActor {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}
