mod utils;

use std::{cell::RefCell, fs::OpenOptions, io::ErrorKind, rc::Rc};

use anyhow::Error;
use tracing_test::traced_test;
use weft_mio::fs;

use crate::utils::given_fixture;

#[test]
#[traced_test]
fn readdir_lists_fixture() -> Result<(), Error> {
    let fixture = given_fixture(&["a.js", "b", "x.txt"])?;

    let names = Rc::new(RefCell::new(None));
    let failed = Rc::new(RefCell::new(false));
    let exited = Rc::new(RefCell::new(false));

    {
        let names = names.clone();
        let failed = failed.clone();
        let exited = exited.clone();
        let path = fixture.path.clone();

        weft_mio::run_event_loop(move |_rt, cx| {
            fs::readdir(cx, &path)
                .on_success(move |value| *names.borrow_mut() = Some(value.clone()))
                .on_failure(move |_| *failed.borrow_mut() = true);

            cx.on_exit(move || *exited.borrow_mut() = true);

            Ok(())
        })?;
    }

    let mut names = names.borrow_mut().take().expect("readdir did not resolve");
    names.sort();

    assert_eq!(names, ["a.js", "b", "x.txt"]);
    assert!(!*failed.borrow());
    assert!(*exited.borrow());

    Ok(())
}

#[test]
#[traced_test]
fn readdir_missing_rejects() -> Result<(), Error> {
    let fixture = given_fixture(&[])?;
    let missing = fixture.path.join("missing");

    let kind = Rc::new(RefCell::new(None));

    {
        let kind = kind.clone();
        weft_mio::run_event_loop(move |_rt, cx| {
            fs::readdir(cx, &missing)
                .on_success(|_| panic!("missing directory listed"))
                .on_failure(move |error| *kind.borrow_mut() = error.kind());

            Ok(())
        })?;
    }

    assert_eq!(*kind.borrow(), Some(ErrorKind::NotFound));

    Ok(())
}

#[test]
#[traced_test]
fn chained_operations_complete_in_order() -> Result<(), Error> {
    let fixture = given_fixture(&["old.txt"])?;
    let base = fixture.path.clone();

    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        weft_mio::run_event_loop(move |_rt, cx| {
            let cx = cx.clone();
            let dir = base.join("sub");

            fs::mkdir(&cx, &dir).on_success({
                let cx = cx.clone();
                let log = log.clone();
                move |_| {
                    log.borrow_mut().push("mkdir");

                    let from = base.join("old.txt");
                    let to = dir.join("new.txt");
                    fs::rename(&cx, &from, &to).on_success({
                        let cx = cx.clone();
                        let log = log.clone();
                        move |_| {
                            log.borrow_mut().push("rename");

                            fs::stat(&cx, &to).on_success(move |stats| {
                                assert!(stats.is_file);
                                assert_eq!(stats.len, 7);
                                log.borrow_mut().push("stat");
                            });
                        }
                    });
                }
            });

            Ok(())
        })?;
    }

    assert_eq!(*log.borrow(), ["mkdir", "rename", "stat"]);
    assert!(fixture.path.join("sub").join("new.txt").exists());

    Ok(())
}

#[test]
#[traced_test]
fn file_written_then_read_back() -> Result<(), Error> {
    let fixture = given_fixture(&[])?;
    let path = fixture.path.join("data.txt");

    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        let path = path.clone();
        weft_mio::run_event_loop(move |_rt, cx| {
            let cx = cx.clone();
            let mut options = OpenOptions::new();
            options.read(true).write(true).create(true);

            fs::open(&cx, &path, &options).on_success(move |fd| {
                let fd = *fd;
                let cx = cx.clone();
                let log = log.clone();

                fs::write(&cx, fd, "hello world", None).on_success({
                    let cx = cx.clone();
                    move |written| {
                        log.borrow_mut().push(format!("wrote {written}"));

                        // Read from an explicit position, the cursor is at the end
                        let log = log.clone();
                        let closing = cx.clone();
                        fs::read(&cx, fd, 5, Some(6)).on_success(move |data| {
                            log.borrow_mut().push(format!("read {:?}", data));

                            let log = log.clone();
                            fs::close(&closing, fd)
                                .on_success(move |_| log.borrow_mut().push("closed".to_string()));
                        });
                    }
                });
            });

            Ok(())
        })?;
    }

    assert_eq!(
        *log.borrow(),
        ["wrote 11", "read b\"world\"", "closed"]
    );
    assert_eq!(std::fs::read_to_string(&path)?, "hello world");

    Ok(())
}

#[test]
#[traced_test]
fn closed_descriptor_rejects() -> Result<(), Error> {
    let fixture = given_fixture(&["a.txt"])?;
    let path = fixture.path.join("a.txt");

    let kinds = Rc::new(RefCell::new(Vec::new()));

    {
        let kinds = kinds.clone();
        weft_mio::run_event_loop(move |_rt, cx| {
            let cx = cx.clone();
            let mut options = OpenOptions::new();
            options.read(true);

            fs::open(&cx, &path, &options).on_success(move |fd| {
                let fd = *fd;
                let kinds = kinds.clone();
                let reading = cx.clone();

                fs::close(&cx, fd).on_success(move |_| {
                    fs::read(&reading, fd, 4, None)
                        .on_success(|_| panic!("read from closed descriptor"))
                        .on_failure(move |error| kinds.borrow_mut().push(error.kind()));
                });
            });

            Ok(())
        })?;
    }

    assert_eq!(*kinds.borrow(), [Some(ErrorKind::InvalidInput)]);

    Ok(())
}

#[test]
#[traced_test]
fn open_missing_file_rejects() -> Result<(), Error> {
    let fixture = given_fixture(&[])?;
    let missing = fixture.path.join("missing.txt");

    let kind = Rc::new(RefCell::new(None));

    {
        let kind = kind.clone();
        weft_mio::run_event_loop(move |_rt, cx| {
            let mut options = OpenOptions::new();
            options.read(true);

            fs::open(cx, &missing, &options)
                .on_success(|_| panic!("missing file opened"))
                .on_failure(move |error| *kind.borrow_mut() = error.kind());

            Ok(())
        })?;
    }

    assert_eq!(*kind.borrow(), Some(ErrorKind::NotFound));

    Ok(())
}
