//! Client session state machine.
//!
//! Each accepted connection runs two cooperating tasks. The reader parses
//! RESP commands, classifies them, and either answers locally or schedules
//! them against backends; the writer consumes completed responses, restores
//! request order with a min-heap keyed on the request sequence, applies
//! MOVED/ASK redirection, and writes replies to the client.
//!
//! Every in-flight request holds a clone of the response channel sender, so
//! when the reader exits the writer naturally drains all outstanding
//! responses before the session tears down.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use log::{debug, error};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};

use crate::cluster::redirect;
use crate::cluster::topology::Dispatcher;
use crate::core::multi::{self, MultiCmdCoordinator};
use crate::core::{BackQueueReceiver, BackQueueSender, PipelineRequest, PipelineResponse};
use crate::error::{ProxyError, ProxyResult};
use crate::proto::command::{self, classify, CoalesceKind, CommandClass};
use crate::proto::{Command, RespError, RespReader, RespValue};
use crate::utils::key_to_slot;

const NOAUTH_ERR: &str = "NOAUTH Authentication required.";
const AUTH_CMD_ERR: &str = "ERR invalid password";
const UNKNOWN_CMD_ERR: &str = "ERR unknown command";
const ARGUMENTS_ERR: &str = "ERR wrong number of arguments";

type CoordinatorMap = Arc<Mutex<HashMap<u64, MultiCmdCoordinator>>>;

/// Serve one client connection until it closes.
///
/// Returns after the reader has seen EOF, every outstanding request has
/// completed, and the writer has drained the response channel.
pub async fn serve<S>(stream: S, peer: String, dispatcher: Arc<Dispatcher>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (backq_tx, backq_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let coordinators: CoordinatorMap = Arc::new(Mutex::new(HashMap::new()));

    let writer = SessionWriter {
        writer: write_half,
        dispatcher: dispatcher.clone(),
        backq_rx,
        coordinators: coordinators.clone(),
        rsp_seq: 0,
        heap: BinaryHeap::new(),
        closed_tx,
        closed: false,
        peer: peer.clone(),
    };
    let writer_task = tokio::spawn(writer.run());

    {
        let mut reader = SessionReader {
            reader: RespReader::new(read_half),
            dispatcher,
            backq: backq_tx,
            coordinators,
            req_seq: 0,
            authed: false,
            multi_buf: None,
            multi_err: false,
            closed_rx,
            peer: peer.clone(),
        };
        reader.run().await;
        // dropping the reader releases its channel sender; the remaining
        // senders belong to in-flight requests and vanish as they complete
    }

    if let Err(err) = writer_task.await {
        if err.is_panic() {
            // sequencing invariants are broken, nothing downstream can be
            // trusted
            error!("session {} writer panicked, aborting", peer);
            std::process::abort();
        }
    }
    debug!("session {} closed", peer);
}

struct SessionReader<R> {
    reader: RespReader<R>,
    dispatcher: Arc<Dispatcher>,
    backq: BackQueueSender,
    coordinators: CoordinatorMap,
    req_seq: u64,
    authed: bool,
    multi_buf: Option<Vec<Command>>,
    multi_err: bool,
    closed_rx: watch::Receiver<bool>,
    peer: String,
}

impl<R: AsyncRead + Unpin> SessionReader<R> {
    async fn run(&mut self) {
        loop {
            let cmd = tokio::select! {
                cmd = self.reader.read_command() => match cmd {
                    Ok(cmd) => cmd,
                    Err(RespError::ConnectionClosed) => {
                        debug!("client {} disconnected", self.peer);
                        break;
                    }
                    Err(err) => {
                        debug!("client {} protocol error: {}", self.peer, err);
                        break;
                    }
                },
                _ = self.closed_rx.changed() => break,
            };
            match cmd.arg(1) {
                // never echo AUTH arguments into the log
                Some(arg) if cmd.name() != "AUTH" => debug!(
                    "access {} {} {}",
                    self.peer,
                    cmd.name(),
                    String::from_utf8_lossy(arg)
                ),
                _ => debug!("access {} {}", self.peer, cmd.name()),
            }
            self.handle(cmd).await;
        }
    }

    async fn handle(&mut self, cmd: Command) {
        if command::auth_required(&cmd) && !self.check_auth() {
            self.reply_error(NOAUTH_ERR);
            return;
        }
        if self.multi_buf.is_some() || cmd.name() == "MULTI" || cmd.name() == "EXEC" {
            self.handle_multi(cmd).await;
            return;
        }
        let class = classify(&cmd);
        match class {
            CommandClass::Auth => self.handle_auth(&cmd),
            CommandClass::Select => self.reply_simple("OK"),
            CommandClass::Ping => self.reply_simple("PONG"),
            CommandClass::Multi | CommandClass::Exec => self.handle_multi(cmd).await,
            CommandClass::Unknown => self.reply_error(UNKNOWN_CMD_ERR),
            CommandClass::ReadAll(coalesce) => self.handle_read_all(cmd, coalesce).await,
            CommandClass::MultiKey {
                coalesce,
                num_keys,
                read_only,
            } => self.handle_multi_key(cmd, coalesce, num_keys, read_only).await,
            CommandClass::General { read_only } => self.handle_general(cmd, read_only),
        }
    }

    fn check_auth(&self) -> bool {
        self.authed || self.dispatcher.connector().password_matches("")
    }

    fn handle_auth(&mut self, cmd: &Command) {
        if cmd.arg_count() != 2 {
            self.reply_error(ARGUMENTS_ERR);
            return;
        }
        let supplied = match cmd.arg(1) {
            Some(arg) => String::from_utf8_lossy(arg).into_owned(),
            None => String::new(),
        };
        if self.dispatcher.connector().password_matches(&supplied) {
            self.authed = true;
            self.reply_simple("OK");
        } else {
            self.reply_error(AUTH_CMD_ERR);
        }
    }

    /// MULTI/EXEC and every command arriving while a transaction buffer is
    /// open. The buffer is replayed sequentially at EXEC time; commands
    /// whose class cannot be queued poison the transaction.
    async fn handle_multi(&mut self, cmd: Command) {
        match cmd.name() {
            "MULTI" => {
                if self.multi_buf.is_some() {
                    self.reply_error("ERR MULTI calls can not be nested");
                } else {
                    self.multi_buf = Some(Vec::new());
                    self.reply_simple("OK");
                }
            }
            "EXEC" => match self.multi_buf.take() {
                None => self.reply_error("ERR EXEC without MULTI"),
                Some(cmds) => {
                    if self.multi_err {
                        self.multi_err = false;
                        self.reply_error("EXECABORT Transaction discarded");
                    } else {
                        let reply = multi::exec_buffered(&self.dispatcher, cmds).await;
                        self.reply_value(reply);
                    }
                }
            },
            _ => match classify(&cmd) {
                CommandClass::General { .. } => {
                    if let Some(buf) = self.multi_buf.as_mut() {
                        buf.push(cmd);
                    }
                    self.reply_simple("QUEUED");
                }
                _ => {
                    self.multi_err = true;
                    self.reply_error(UNKNOWN_CMD_ERR);
                }
            },
        }
    }

    fn handle_general(&mut self, cmd: Command, read_only: bool) {
        let key = match cmd.key() {
            Some(key) => key.clone(),
            None => {
                self.reply_error(ARGUMENTS_ERR);
                return;
            }
        };
        let slot = key_to_slot(&key);
        let req = PipelineRequest {
            cmd,
            slot,
            read_only,
            seq: self.next_seq(),
            sub_seq: 0,
            is_sub: false,
        };
        self.schedule(req);
    }

    async fn handle_multi_key(
        &mut self,
        cmd: Command,
        coalesce: CoalesceKind,
        num_keys: usize,
        read_only: bool,
    ) {
        if cmd.name() == "MSET" && cmd.arg_count() % 2 == 0 {
            self.reply_error(ARGUMENTS_ERR);
            return;
        }
        let seq = self.next_seq();
        let mc = MultiCmdCoordinator::scatter(cmd, coalesce, num_keys);
        let subs: Vec<Command> = (0..num_keys).map(|i| mc.sub_cmd(i)).collect();
        // register before scheduling so no sub-response can win the race
        self.coordinators.lock().await.insert(seq, mc);
        for (sub_seq, sub) in subs.into_iter().enumerate() {
            let key = sub.key().cloned().unwrap_or_default();
            let req = PipelineRequest {
                slot: key_to_slot(&key),
                cmd: sub,
                read_only,
                seq,
                sub_seq,
                is_sub: true,
            };
            self.schedule(req);
        }
    }

    async fn handle_read_all(&mut self, cmd: Command, coalesce: CoalesceKind) {
        let slots = self.dispatcher.server_slots().await;
        if slots.is_empty() {
            self.reply_error("ERR no backend available");
            return;
        }
        let seq = self.next_seq();
        let mc = MultiCmdCoordinator::fanout(cmd.clone(), coalesce, slots.len());
        self.coordinators.lock().await.insert(seq, mc);
        for (sub_seq, slot) in slots.into_iter().enumerate() {
            let req = PipelineRequest {
                cmd: cmd.clone(),
                slot,
                read_only: true,
                seq,
                sub_seq,
                is_sub: true,
            };
            self.schedule(req);
        }
    }

    /// Run the backend exchange on its own task so pipelined requests
    /// proceed in parallel and may complete out of order.
    fn schedule(&self, req: PipelineRequest) {
        let dispatcher = self.dispatcher.clone();
        let backq = self.backq.clone();
        tokio::spawn(schedule_request(dispatcher, backq, req));
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.req_seq;
        self.req_seq += 1;
        seq
    }

    /// Enqueue a locally produced reply. It consumes a sequence number like
    /// any forwarded request, keeping pipelined replies in arrival order.
    fn reply_value(&mut self, value: RespValue) {
        let ctx = PipelineRequest {
            cmd: Command::default(),
            slot: 0,
            read_only: false,
            seq: self.next_seq(),
            sub_seq: 0,
            is_sub: false,
        };
        let _ = self.backq.send(PipelineResponse {
            ctx,
            result: Ok(value),
        });
    }

    fn reply_simple(&mut self, msg: &str) {
        self.reply_value(RespValue::SimpleString(msg.to_string()));
    }

    fn reply_error(&mut self, msg: &str) {
        self.reply_value(RespValue::error(msg));
    }
}

async fn schedule_request(
    dispatcher: Arc<Dispatcher>,
    backq: BackQueueSender,
    req: PipelineRequest,
) {
    let endpoint = if req.read_only {
        dispatcher.read_endpoint(req.slot, req.seq).await
    } else {
        dispatcher.write_endpoint(req.slot).await
    };
    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => {
            let err = ProxyError::cluster(format!("no backend for slot {}", req.slot));
            let _ = backq.send(PipelineResponse {
                ctx: req,
                result: Err(err),
            });
            return;
        }
    };
    let mut conn = match dispatcher.pool().get(&endpoint).await {
        Ok(conn) => conn,
        Err(err) => {
            let _ = backq.send(PipelineResponse {
                ctx: req,
                result: Err(err),
            });
            return;
        }
    };
    match conn.request(req, &backq).await {
        Ok(rsp) => {
            let _ = backq.send(rsp);
            dispatcher.pool().put(conn).await;
        }
        Err(err) => {
            // the inflight drain already delivered the error response
            debug!("backend {} request failed: {}", endpoint, err);
            if conn.is_connected() {
                dispatcher.pool().put(conn).await;
            }
        }
    }
}

struct SessionWriter<W> {
    writer: W,
    dispatcher: Arc<Dispatcher>,
    backq_rx: BackQueueReceiver,
    coordinators: CoordinatorMap,
    rsp_seq: u64,
    heap: BinaryHeap<HeapEntry>,
    closed_tx: watch::Sender<bool>,
    closed: bool,
    peer: String,
}

impl<W: AsyncWrite + Unpin> SessionWriter<W> {
    async fn run(mut self) {
        while let Some(rsp) = self.backq_rx.recv().await {
            if let Err(err) = self.handle_pipeline(rsp).await {
                if !self.closed {
                    debug!("session {} write failed: {}", self.peer, err);
                    self.closed = true;
                    // wake the reader so it stops accepting new commands;
                    // keep draining so in-flight requests settle
                    let _ = self.closed_tx.send(true);
                }
            }
        }
    }

    /// Deliver a response in request order: handle it now when its sequence
    /// is next, otherwise park it on the heap until its turn comes.
    async fn handle_pipeline(&mut self, rsp: PipelineResponse) -> ProxyResult<()> {
        if rsp.ctx.seq != self.rsp_seq {
            self.heap.push(HeapEntry(rsp));
            return Ok(());
        }
        self.handle_resp(rsp).await?;
        loop {
            let ready = match self.heap.peek() {
                Some(entry) => entry.0.ctx.seq == self.rsp_seq,
                None => false,
            };
            if !ready {
                return Ok(());
            }
            if let Some(entry) = self.heap.pop() {
                self.handle_resp(entry.0).await?;
            }
        }
    }

    async fn handle_resp(&mut self, rsp: PipelineResponse) -> ProxyResult<()> {
        if rsp.ctx.seq != self.rsp_seq {
            panic!(
                "response sequence out of order: got {}, expected {}",
                rsp.ctx.seq, self.rsp_seq
            );
        }
        if !rsp.ctx.is_sub {
            self.rsp_seq += 1;
        }
        let value = match rsp.result {
            Err(err) => {
                // transport errors are redirect-worthy: the topology may
                // have changed under us
                self.dispatcher.trigger_reload_slots();
                RespValue::error(format!("ERR {}", err))
            }
            Ok(value) => redirect::resolve(&self.dispatcher, &rsp.ctx.cmd, value).await,
        };
        if self.closed {
            return Ok(());
        }
        self.write_resp(&rsp.ctx, value).await
    }

    /// Write one reply to the client. Sub-responses accumulate in their
    /// coordinator and only the coalesced reply reaches the wire.
    async fn write_resp(&mut self, ctx: &PipelineRequest, value: RespValue) -> ProxyResult<()> {
        let buf = if ctx.is_sub {
            let mut coordinators = self.coordinators.lock().await;
            let finished = match coordinators.get_mut(&ctx.seq) {
                Some(mc) => {
                    mc.on_sub_finished(ctx.sub_seq, value);
                    mc.finished()
                }
                None => panic!("no coordinator for request sequence {}", ctx.seq),
            };
            if !finished {
                return Ok(());
            }
            let mc = match coordinators.remove(&ctx.seq) {
                Some(mc) => mc,
                None => return Ok(()),
            };
            drop(coordinators);
            self.rsp_seq += 1;
            mc.coalesce().encode()
        } else {
            value.encode()
        };
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Min-heap entry ordered by request sequence
struct HeapEntry(PipelineResponse);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.ctx.seq == other.0.ctx.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, invert for smallest-sequence-first
        other.0.ctx.seq.cmp(&self.0.ctx.seq)
    }
}
