mod utils;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::mpsc::RecvTimeoutError,
    time::Duration,
};

use anyhow::Error;
use tracing_test::traced_test;
use weft_http::{
    create_client, create_server, BodyEncoding, ClientResponse, Headers, HttpError, Response,
    Server, ServerOptions,
};
use weft_mio::run_event_loop;

use crate::utils::{given_raw_client, localhost};

#[derive(Default)]
struct Exchanges {
    requests: RefCell<Vec<Received>>,
    responses: RefCell<Vec<(u16, String)>>,
    sent: Cell<usize>,
    received: Cell<usize>,
    failures: Cell<usize>,
    at_exit: Cell<Option<(usize, usize)>>,
}

#[derive(Debug, PartialEq, Eq)]
struct Received {
    method: String,
    path: String,
    foo: Option<String>,
    accepts: bool,
}

#[test]
#[traced_test]
fn get_and_delayed_post_overlap() -> Result<(), Error> {
    let state = Rc::new(Exchanges::default());

    {
        let state = state.clone();
        run_event_loop(move |_rt, cx| {
            let server = {
                let state = state.clone();
                create_server(cx, move |server, request, response| {
                    let path = request.uri().path().to_string();
                    let headers = request.headers();
                    state.requests.borrow_mut().push(Received {
                        method: request.method().to_string(),
                        path: path.clone(),
                        foo: headers.get("FOO").map(str::to_string),
                        accepts: headers.contains("aCCEPT") && headers.get("accept") == Some("*/*"),
                    });

                    // Both expected requests arrived, stop accepting more
                    if state.requests.borrow().len() == 2 {
                        server.close();
                    }

                    let state = state.clone();
                    request.on_complete(move || {
                        respond(&response, &path).expect("failed to respond");
                        state.sent.set(state.sent.get() + 1);
                    });
                })
            };
            let addr = server.listen(localhost()?)?;

            let client = create_client(cx, addr);

            let on_get = {
                let state = state.clone();
                move |response: &ClientResponse| collect(&state, response, BodyEncoding::Ascii)
            };
            let headers = Headers::from([("Accept", "*/*"), ("Foo", "bar")]);
            let deferred = client.get("/hello", headers).finish(on_get);
            count_failures(&state, &deferred);

            // Sent while the first exchange may still be in flight
            {
                let state = state.clone();
                cx.after(Duration::from_millis(1), move || {
                    let on_post = {
                        let state = state.clone();
                        move |response: &ClientResponse| {
                            collect(&state, response, BodyEncoding::Utf8)
                        }
                    };
                    let deferred = client.post("/world", Headers::new(), b"").finish(on_post);
                    count_failures(&state, &deferred);
                });
            }

            let state = state.clone();
            cx.on_exit(move || {
                let counts = (state.sent.get(), state.received.get());
                state.at_exit.set(Some(counts));
            });

            Ok(())
        })?;
    }

    let mut requests = state.requests.take();
    requests.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(
        requests,
        [
            Received {
                method: "GET".to_string(),
                path: "/hello".to_string(),
                foo: Some("bar".to_string()),
                accepts: true,
            },
            Received {
                method: "POST".to_string(),
                path: "/world".to_string(),
                foo: None,
                accepts: false,
            },
        ]
    );

    let mut responses = state.responses.take();
    responses.sort();
    assert_eq!(
        responses,
        [
            (200, "The path was /hello".to_string()),
            (200, "The path was /world".to_string()),
        ]
    );
    assert_eq!(state.failures.get(), 0);
    assert_eq!(state.at_exit.get(), Some((2, 2)));

    Ok(())
}

#[test]
#[traced_test]
fn idle_connection_is_closed() -> Result<(), Error> {
    let disconnects = Rc::new(Cell::new(0));
    let mut raw = None;

    {
        let disconnects = disconnects.clone();
        let raw = &mut raw;
        run_event_loop(move |_rt, cx| {
            let options = ServerOptions::default().with_idle_timeout(Some(Duration::from_millis(20)));
            let server = Server::with_options(cx, options, |_, _, _| panic!("no request expected"));

            let closing = server.clone();
            server.on("connection", move |_| closing.close());
            server.on("disconnect", move |_| disconnects.set(disconnects.get() + 1));

            let addr = server.listen(localhost()?)?;
            *raw = Some(given_raw_client(addr, b""));

            Ok(())
        })?;
    }

    let received = raw
        .ok_or_else(|| anyhow::anyhow!("raw client not started"))?
        .recv_timeout(Duration::from_secs(5))?;

    assert!(received.is_empty());
    assert_eq!(disconnects.get(), 1);
    assert!(logs_contain("connection idle"));

    Ok(())
}

#[test]
#[traced_test]
fn pipelined_responses_keep_request_order() -> Result<(), Error> {
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut raw = None;

    {
        let order = order.clone();
        let raw = &mut raw;
        run_event_loop(move |_rt, cx| {
            let handler_cx = cx.clone();
            let server = create_server(cx, move |server, request, response| {
                let path = request.uri().path().to_string();
                order.borrow_mut().push(path.clone());

                if path == "/second" {
                    server.close();
                    respond(&response, &path).expect("failed to respond");
                    return;
                }

                // The first response is only ready after the second
                handler_cx.after(Duration::from_millis(5), move || {
                    respond(&response, &path).expect("failed to respond");
                });
            });
            let addr = server.listen(localhost()?)?;

            *raw = Some(given_raw_client(
                addr,
                b"GET /first HTTP/1.1\r\nHost: test\r\n\r\n\
                  GET /second HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
            ));

            Ok(())
        })?;
    }

    let received = raw
        .ok_or_else(|| anyhow::anyhow!("raw client not started"))?
        .recv_timeout(Duration::from_secs(5))?;
    let received = String::from_utf8(received)?;

    assert_eq!(*order.borrow(), ["/first", "/second"]);
    let first = received.find("The path was /first");
    let second = received.find("The path was /second");
    assert!(first.is_some() && second.is_some());
    assert!(first < second);

    Ok(())
}

#[test]
#[traced_test]
fn malformed_request_closes_without_handler() -> Result<(), Error> {
    let calls = Rc::new(Cell::new(0));
    let mut raw = None;

    {
        let calls = calls.clone();
        let raw = &mut raw;
        run_event_loop(move |_rt, cx| {
            let server = create_server(cx, move |_, _, _| calls.set(calls.get() + 1));

            // Only the one connection is expected
            let closing = server.clone();
            server.on("connection", move |_| closing.close());

            let addr = server.listen(localhost()?)?;
            *raw = Some(given_raw_client(addr, b"BOGUS\r\n\r\n"));

            Ok(())
        })?;
    }

    let received = raw
        .ok_or_else(|| anyhow::anyhow!("raw client not started"))?
        .recv_timeout(Duration::from_secs(5));

    assert_eq!(calls.get(), 0);
    assert!(logs_contain("malformed request"));
    match received {
        Ok(received) => assert!(received.is_empty()),
        Err(RecvTimeoutError::Timeout) => panic!("connection was not closed"),
        Err(RecvTimeoutError::Disconnected) => panic!("raw client failed"),
    }

    Ok(())
}

#[test]
#[traced_test]
fn request_body_is_delivered() -> Result<(), Error> {
    let state = Rc::new(Exchanges::default());
    let bodies = Rc::new(RefCell::new(Vec::new()));

    {
        let state = state.clone();
        let bodies = bodies.clone();
        run_event_loop(move |_rt, cx| {
            let server = create_server(cx, move |server, request, response| {
                server.close();
                request.set_body_encoding(BodyEncoding::Utf8);

                let body = Rc::new(RefCell::new(String::new()));
                {
                    let body = body.clone();
                    request.on_body(move |chunk| {
                        body.borrow_mut().push_str(chunk.as_text().unwrap_or_default())
                    });
                }

                let bodies = bodies.clone();
                request.on_complete(move || {
                    bodies.borrow_mut().push(body.borrow().clone());
                    respond(&response, "/echo").expect("failed to respond");
                });
            });
            let addr = server.listen(localhost()?)?;

            let client = create_client(cx, addr);
            let mut request = client.request("PUT", "/echo", Headers::new());
            request.send_body("ping ").send_body("pong");

            let on_response = {
                let state = state.clone();
                move |response: &ClientResponse| collect(&state, response, BodyEncoding::Utf8)
            };
            let deferred = request.finish(on_response);
            count_failures(&state, &deferred);

            Ok(())
        })?;
    }

    assert_eq!(*bodies.borrow(), ["ping pong"]);
    assert_eq!(
        *state.responses.borrow(),
        [(200, "The path was /echo".to_string())]
    );
    assert_eq!(state.failures.get(), 0);

    Ok(())
}

#[test]
#[traced_test]
fn response_misuse_is_rejected() -> Result<(), Error> {
    let checks = Rc::new(RefCell::new(Vec::new()));

    {
        let checks = checks.clone();
        run_event_loop(move |_rt, cx| {
            let server = create_server(cx, move |server, _request, response| {
                server.close();
                let mut checks = checks.borrow_mut();

                checks.push(matches!(
                    response.send_body("early"),
                    Err(HttpError::HeadersNotSent)
                ));
                checks.push(matches!(response.finish(), Err(HttpError::HeadersNotSent)));

                checks.push(response.send_header(204, Headers::new()).is_ok());
                checks.push(matches!(
                    response.send_header(200, Headers::new()),
                    Err(HttpError::HeadersAlreadySent)
                ));

                checks.push(response.finish().is_ok());
                checks.push(matches!(response.finish(), Err(HttpError::AlreadyFinished)));
            });
            let addr = server.listen(localhost()?)?;

            let client = create_client(cx, addr);
            client.get("/", Headers::new()).finish(|_| {});

            Ok(())
        })?;
    }

    assert_eq!(*checks.borrow(), [true; 6]);

    Ok(())
}

#[test]
#[traced_test]
fn listen_twice_fails() -> Result<(), Error> {
    run_event_loop(|_rt, cx| {
        let server = create_server(cx, |_, _, _| {});
        let addr = server.listen(localhost()?)?;

        let result = server.listen(localhost()?);
        assert!(matches!(result, Err(HttpError::AlreadyListening)));

        let other = create_server(cx, |_, _, _| {});
        let result = other.listen(addr);
        assert!(matches!(result, Err(HttpError::AddressInUse(used)) if used == addr));

        server.close();
        Ok(())
    })?;

    Ok(())
}

#[test]
#[traced_test]
fn refused_connection_rejects() -> Result<(), Error> {
    // Find a port with nothing listening on it
    let addr = std::net::TcpListener::bind(localhost()?)?.local_addr()?;
    let rejected = Rc::new(Cell::new(false));

    {
        let rejected = rejected.clone();
        run_event_loop(move |_rt, cx| {
            let client = create_client(cx, addr);

            let deferred = client
                .get("/", Headers::new())
                .finish(|_| panic!("no response expected"));
            deferred.on_failure(move |error| {
                rejected.set(matches!(error, HttpError::Connection(_) | HttpError::Io(_)));
            });

            Ok(())
        })?;
    }

    assert!(rejected.get());

    Ok(())
}

fn respond(response: &Response, path: &str) -> Result<(), HttpError> {
    response.send_header(200, [("Content-Type", "text/plain")])?;
    response.send_body(format!("The path was {path}"))?;
    response.finish()
}

/// Collect a response's text body, recording it on completion.
fn collect(state: &Rc<Exchanges>, response: &ClientResponse, encoding: BodyEncoding) {
    response.set_body_encoding(encoding);

    let body = Rc::new(RefCell::new(String::new()));
    {
        let body = body.clone();
        response.on_body(move |chunk| {
            body.borrow_mut().push_str(chunk.as_text().unwrap_or_default())
        });
    }

    let status = response.status();
    let state = state.clone();
    response.on_complete(move || {
        state.received.set(state.received.get() + 1);
        state
            .responses
            .borrow_mut()
            .push((status, body.borrow().clone()));
    });
}

fn count_failures(state: &Rc<Exchanges>, deferred: &weft::Deferred<ClientResponse, HttpError>) {
    let state = state.clone();
    deferred.on_failure(move |error| {
        tracing::error!(?error, "exchange failed");
        state.failures.set(state.failures.get() + 1);
    });
}
