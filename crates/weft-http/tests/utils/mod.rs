use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::mpsc::{self, Receiver},
    thread,
};

use anyhow::Error;

pub fn localhost() -> Result<SocketAddr, Error> {
    Ok("127.0.0.1:0".parse()?)
}

/// Blocking client on its own thread, writing `request` and reading until the server closes.
pub fn given_raw_client(addr: SocketAddr, request: &'static [u8]) -> Receiver<Vec<u8>> {
    let (sender, receiver) = mpsc::channel();

    thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).expect("failed to connect");
        stream.write_all(request).expect("failed to write");

        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received);
        let _ = sender.send(received);
    });

    receiver
}
