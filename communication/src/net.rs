//! TCP cluster backend: a full mesh of sockets with per-connection service
//! threads.
//!
//! Every process is one peer. Each established socket gets a send thread
//! (draining a channel of encoded frames) and a receive thread (decoding
//! frames into the local mailboxes). The channel between `send_data` and
//! the send thread is unbounded; it plays the role of a process-wide send
//! buffer sized by available memory.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{ByteOrder, NativeEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{unbounded, Sender};
use tracing::{info, trace};

use crate::mailbox::Mailboxes;
use crate::rpc::{CompleteRequest, Request, Rpc, Tag};

const HEADER_BYTES: usize = 16;
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// One direction of the mesh: frames bound for a single remote peer.
struct Connection {
    frames: Sender<Vec<u8>>,
    // sequence number of the last frame handed to the send thread; guards
    // the channel so sequence order matches channel order
    enqueued: Mutex<u64>,
    flushed: Arc<AtomicU64>,
}

/// Completion handle for a cluster send: done once the send thread has
/// written this frame (and everything before it) to the socket.
struct NetRequest {
    flushed: Arc<AtomicU64>,
    seq: u64,
}

impl Request for NetRequest {
    fn done(&mut self) -> bool {
        self.flushed.load(Ordering::Acquire) >= self.seq
    }

    fn wait(&mut self) {
        while !self.done() {
            thread::yield_now();
        }
    }
}

/// One process of a TCP mesh; implements [`Rpc`] with this process as a
/// single peer. Cheap to clone.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    index: usize,
    peers: usize,
    mailboxes: Arc<Mailboxes>,
    connections: Vec<Option<Connection>>,
    // read-half handles for unblocking our receive threads at teardown
    sockets: Vec<TcpStream>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for NetworkInner {
    fn drop(&mut self) {
        // closing the channels lets the send threads drain and shut down
        // their write halves, which unblocks the remote receive threads
        self.connections.clear();
        // everything owed to this process has been received by now, so the
        // local receive threads can be unblocked without waiting on peers
        for socket in &self.sockets {
            let _ = socket.shutdown(Shutdown::Read);
        }
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Connects this process to every other address in `addresses` and starts
/// the per-connection service threads.
///
/// Processes with a lower index are dialed; processes with a higher index
/// are awaited on the local listener. The one-word handshake after connect
/// tells the acceptor who dialed.
pub fn initialize_networking(
    addresses: Vec<String>,
    my_index: usize,
    report: bool,
) -> io::Result<Network> {
    let peers = addresses.len();
    assert!(my_index < peers, "process {} not in the address list", my_index);

    let listener = TcpListener::bind(&addresses[my_index][..])?;
    let mut streams: Vec<Option<TcpStream>> = (0..peers).map(|_| None).collect();

    for index in 0..my_index {
        loop {
            match TcpStream::connect(&addresses[index][..]) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    stream.write_u64::<NativeEndian>(my_index as u64)?;
                    if report {
                        info!(process = my_index, peer = index, "connected");
                    }
                    streams[index] = Some(stream);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    // the peer has not bound its listener yet
                    thread::sleep(CONNECT_RETRY);
                }
                Err(err) => return Err(err),
            }
        }
    }

    for _ in my_index + 1..peers {
        let (mut stream, _addr) = listener.accept()?;
        stream.set_nodelay(true)?;
        let index = stream.read_u64::<NativeEndian>()? as usize;
        assert!(
            index > my_index && index < peers,
            "unexpected handshake from process {}",
            index
        );
        assert!(streams[index].is_none(), "process {} connected twice", index);
        if report {
            info!(process = my_index, peer = index, "accepted");
        }
        streams[index] = Some(stream);
    }

    let mailboxes = Arc::new(Mailboxes::new(peers));
    let mut connections = Vec::with_capacity(peers);
    let mut sockets = Vec::new();
    let mut threads = Vec::new();

    for (index, stream) in streams.into_iter().enumerate() {
        let stream = match stream {
            Some(stream) => stream,
            None => {
                connections.push(None);
                continue;
            }
        };
        sockets.push(stream.try_clone()?);

        let (tx, rx) = unbounded::<Vec<u8>>();
        let flushed = Arc::new(AtomicU64::new(0));

        let mut writer = stream.try_clone()?;
        let written = Arc::clone(&flushed);
        threads.push(
            thread::Builder::new()
                .name(format!("synchromesh:send-{}", index))
                .spawn(move || {
                    let mut sent = 0u64;
                    while let Ok(frame) = rx.recv() {
                        writer.write_all(&frame).expect("peer connection lost");
                        sent += 1;
                        written.store(sent, Ordering::Release);
                    }
                    let _ = writer.shutdown(Shutdown::Write);
                })?,
        );

        let mut reader = stream;
        let boxes = Arc::clone(&mailboxes);
        threads.push(
            thread::Builder::new()
                .name(format!("synchromesh:recv-{}", index))
                .spawn(move || {
                    let mut header = [0u8; HEADER_BYTES];
                    loop {
                        match reader.read_exact(&mut header) {
                            Ok(()) => {}
                            // either side shut the connection down
                            Err(err)
                                if matches!(
                                    err.kind(),
                                    io::ErrorKind::UnexpectedEof
                                        | io::ErrorKind::ConnectionReset
                                        | io::ErrorKind::ConnectionAborted
                                ) =>
                            {
                                break
                            }
                            Err(err) => panic!("connection to process {} lost: {}", index, err),
                        }
                        let tag = NativeEndian::read_u64(&header[..8]);
                        let len = NativeEndian::read_u64(&header[8..]) as usize;
                        let mut payload = vec![0; len];
                        reader.read_exact(&mut payload).expect("truncated frame");
                        boxes.push(index, tag, payload);
                    }
                })?,
        );

        connections.push(Some(Connection {
            frames: tx,
            enqueued: Mutex::new(0),
            flushed,
        }));
    }

    Ok(Network {
        inner: Arc::new(NetworkInner {
            index: my_index,
            peers,
            mailboxes,
            connections,
            sockets,
            threads: Mutex::new(threads),
        }),
    })
}

impl Rpc for Network {
    fn send_data(&self, dst: usize, tag: Tag, data: &[u8]) -> Box<dyn Request> {
        let inner = &self.inner;
        assert!(dst < inner.peers, "destination {} out of range", dst);
        trace!(src = inner.index, dst, tag, bytes = data.len(), "send");

        if dst == inner.index {
            // the self-loop stays in process
            inner.mailboxes.push(dst, tag, data.to_vec());
            return Box::new(CompleteRequest);
        }

        let mut frame = Vec::with_capacity(HEADER_BYTES + data.len());
        frame.write_u64::<NativeEndian>(tag).unwrap();
        frame.write_u64::<NativeEndian>(data.len() as u64).unwrap();
        frame.extend_from_slice(data);

        let conn = inner.connections[dst].as_ref().unwrap();
        let seq = {
            let mut enqueued = conn.enqueued.lock().unwrap();
            *enqueued += 1;
            conn.frames.send(frame).expect("send thread exited");
            *enqueued
        };
        Box::new(NetRequest {
            flushed: Arc::clone(&conn.flushed),
            seq,
        })
    }

    fn recv_data(&self, src: Option<usize>, tag: Option<Tag>, buf: &mut [u8]) -> (usize, Tag) {
        if let Some(s) = src {
            assert!(s < self.inner.peers, "source {} out of range", s);
        }
        let (s, t, payload) = self.inner.mailboxes.recv(src, tag);
        assert_eq!(
            payload.len(),
            buf.len(),
            "length mismatch receiving from {} tag {}",
            s,
            t
        );
        buf.copy_from_slice(&payload);
        trace!(src = s, dst = self.inner.index, tag = t, bytes = buf.len(), "recv");
        (s, t)
    }

    fn poll(&self, src: Option<usize>, tag: Option<Tag>) -> bool {
        self.inner.mailboxes.poll(src, tag)
    }

    fn first(&self) -> usize {
        0
    }

    fn last(&self) -> usize {
        self.inner.peers - 1
    }

    fn id(&self) -> usize {
        self.inner.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two-process meshes on loopback; each test picks its own ports.

    #[test]
    fn loopback_pair_round_trip() {
        let addrs = vec!["127.0.0.1:42201".to_string(), "127.0.0.1:42202".to_string()];
        let peer = addrs.clone();
        let other = thread::spawn(move || {
            let net = initialize_networking(peer, 1, false).unwrap();
            let mut buf = [0u8; 4];
            let (src, tag) = net.recv_data(Some(0), Some(7), &mut buf);
            assert_eq!((src, tag), (0, 7));
            assert_eq!(&buf, b"ping");
            net.send_data(0, 8, b"pong").wait();
        });

        let net = initialize_networking(addrs, 0, false).unwrap();
        net.send_data(1, 7, b"ping").wait();
        let mut buf = [0u8; 4];
        let (src, _) = net.recv_data(None, Some(8), &mut buf);
        assert_eq!(src, 1);
        assert_eq!(&buf, b"pong");
        other.join().unwrap();
    }

    #[test]
    fn self_send_skips_the_socket() {
        let addrs = vec!["127.0.0.1:42211".to_string(), "127.0.0.1:42212".to_string()];
        let peer = addrs.clone();
        let other = thread::spawn(move || {
            let net = initialize_networking(peer, 1, false).unwrap();
            // participate in the mesh, then idle until the peer is done
            net.send_data(0, 99, b"done").wait();
        });

        let net = initialize_networking(addrs, 0, false).unwrap();
        let mut req = net.send_data(0, 5, b"self");
        assert!(req.done());
        let mut buf = [0u8; 4];
        assert_eq!(net.recv_data(Some(0), Some(5), &mut buf), (0, 5));
        assert_eq!(&buf, b"self");
        let mut sync = [0u8; 4];
        net.recv_data(Some(1), Some(99), &mut sync);
        other.join().unwrap();
    }
}
