use anyhow::Error;
use tracing::{event, Level};
use weft_mio::fs;

fn main() -> Result<(), Error> {
    devutils::init_logging();

    let path = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());

    weft_mio::run_event_loop(move |_rt, cx| {
        fs::readdir(cx, &path)
            .on_success(|names| {
                let mut names = names.clone();
                names.sort();

                for name in names {
                    println!("{name}");
                }
            })
            .on_failure(|error| event!(Level::ERROR, ?error, "failed to read directory"));

        cx.on_exit(|| event!(Level::DEBUG, "exiting"));

        Ok(())
    })?;

    Ok(())
}
