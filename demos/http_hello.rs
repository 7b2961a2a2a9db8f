use std::time::Duration;

use anyhow::Error;
use tracing::{event, Level};
use weft_http::{create_client, create_server, BodyEncoding, Headers};
use weft_mio::Context;

fn main() -> Result<(), Error> {
    devutils::init_logging();

    weft_mio::run_event_loop(|_rt, cx| init(cx))?;

    Ok(())
}

fn init(cx: &Context) -> Result<(), Error> {
    let server = create_server(cx, |server, request, response| {
        event!(Level::INFO, method = request.method(), uri = %request.uri(), "received request");

        // Serve a single request, then stop
        server.close();

        let path = request.uri().path().to_string();
        request.on_complete(move || {
            let body = format!("<!DOCTYPE html><html><body><h1>Hello, {path}!</h1></body></html>");

            let result = response
                .send_header(200, [("Content-Type", "text/html")])
                .and_then(|_| response.send_body(&body))
                .and_then(|_| response.finish());
            if let Err(error) = result {
                event!(Level::ERROR, ?error, "failed to respond");
            }
        });
    });
    let addr = server.listen("127.0.0.1:1234".parse()?)?;

    // Give the demo a visible request after a short delay
    let client = create_client(cx, addr);
    cx.after(Duration::from_millis(10), move || {
        let deferred = client.get("/world", Headers::new()).finish(|response| {
            event!(Level::INFO, status = response.status(), "response received");
            response.set_body_encoding(BodyEncoding::Utf8);
            response.on_body(|chunk| println!("{}", chunk.as_text().unwrap_or_default()));
        });
        deferred.on_failure(|error| event!(Level::ERROR, ?error, "request failed"));
    });

    cx.on_exit(|| event!(Level::INFO, "done"));

    Ok(())
}
