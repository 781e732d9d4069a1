// ============================================================================
// OFF-THREAD WORKER - selection refinement and spot heal on the rayon pool
// ============================================================================
//
// Requests own their buffers and are moved into the job; replies move the
// result back. Every request gets a monotonic id so late replies can be
// recognised and dropped:
//   * selection refinement: only the most recently submitted one counts
//   * spot heal: a reply older than the last applied heal on the same layer
//     is dropped
// ============================================================================

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use image::{GrayImage, RgbaImage};

use crate::ops::retouch::spot_heal;
use crate::ops::selection::{RefineParams, refine_selection};
use crate::project::{LayerId, Point};

pub type RequestId = u64;

pub enum WorkerRequest {
    RefineSelection {
        width: u32,
        height: u32,
        polygons: Vec<Vec<Point>>,
        params: RefineParams,
    },
    SpotHeal {
        layer_id: LayerId,
        width: u32,
        height: u32,
        pixels: RgbaImage,
        x: f32,
        y: f32,
        radius: f32,
    },
}

impl WorkerRequest {
    pub fn operation(&self) -> Operation {
        match self {
            WorkerRequest::RefineSelection { .. } => Operation::RefineSelection,
            WorkerRequest::SpotHeal { layer_id, .. } => Operation::SpotHeal(*layer_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    RefineSelection,
    SpotHeal(LayerId),
}

#[derive(Debug)]
pub enum WorkerResponse {
    Mask { width: u32, height: u32, mask: GrayImage },
    Pixels { width: u32, height: u32, pixels: RgbaImage },
    Failed { reason: String },
}

#[derive(Debug)]
pub struct WorkerReply {
    pub id: RequestId,
    pub operation: Operation,
    pub response: WorkerResponse,
}

/// Execute one request on the calling thread.
pub fn run_request(request: WorkerRequest) -> WorkerResponse {
    match request {
        WorkerRequest::RefineSelection { width, height, polygons, params } => {
            match refine_selection(width, height, &polygons, &params) {
                Ok(mask) => WorkerResponse::Mask { width, height, mask },
                Err(e) => WorkerResponse::Failed { reason: e.to_string() },
            }
        }
        WorkerRequest::SpotHeal { width, height, mut pixels, x, y, radius, .. } => {
            if pixels.dimensions() != (width, height) {
                return WorkerResponse::Failed {
                    reason: format!(
                        "buffer is {}x{} but request says {}x{}",
                        pixels.width(),
                        pixels.height(),
                        width,
                        height
                    ),
                };
            }
            match spot_heal(&mut pixels, x, y, radius) {
                Ok(_) => WorkerResponse::Pixels { width, height, pixels },
                Err(e) => WorkerResponse::Failed { reason: e.to_string() },
            }
        }
    }
}

pub struct EditWorker {
    next_id: RequestId,
    in_flight: usize,
    latest_refine: RequestId,
    last_applied_heal: HashMap<LayerId, RequestId>,
    sender: mpsc::Sender<WorkerReply>,
    receiver: mpsc::Receiver<WorkerReply>,
}

impl Default for EditWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl EditWorker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            next_id: 0,
            in_flight: 0,
            latest_refine: 0,
            last_applied_heal: HashMap::new(),
            sender,
            receiver,
        }
    }

    /// Queue `request` on the rayon pool. The request (and any buffer in
    /// it) is moved; the caller keeps only the id.
    pub fn submit(&mut self, request: WorkerRequest) -> RequestId {
        self.next_id += 1;
        let id = self.next_id;
        let operation = request.operation();
        if operation == Operation::RefineSelection {
            self.latest_refine = id;
        }
        self.in_flight += 1;

        let sender = self.sender.clone();
        rayon::spawn(move || {
            let response = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run_request(request)))
                .unwrap_or_else(|panic_info| {
                    let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic payload".to_string()
                    };
                    WorkerResponse::Failed { reason: format!("worker panicked: {}", msg) }
                });
            let _ = sender.send(WorkerReply { id, operation, response });
        });
        id
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Drain every finished reply, dropping stale ones.
    pub fn poll(&mut self) -> Vec<WorkerReply> {
        let mut fresh = Vec::new();
        while let Ok(reply) = self.receiver.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            if let Some(reply) = self.accept(reply) {
                fresh.push(reply);
            }
        }
        fresh
    }

    /// Block for the next non-stale reply. `None` when nothing is in
    /// flight or `timeout` passes without an arrival.
    pub fn wait_next(&mut self, timeout: Duration) -> Option<WorkerReply> {
        while self.in_flight > 0 {
            let reply = self.receiver.recv_timeout(timeout).ok()?;
            self.in_flight -= 1;
            if let Some(reply) = self.accept(reply) {
                return Some(reply);
            }
        }
        None
    }

    fn accept(&mut self, reply: WorkerReply) -> Option<WorkerReply> {
        if let WorkerResponse::Failed { reason } = &reply.response {
            crate::log_warn!("Worker request {} ({:?}) failed: {}", reply.id, reply.operation, reason);
        }
        match reply.operation {
            Operation::RefineSelection => {
                if reply.id < self.latest_refine {
                    crate::log_info!("Dropping stale selection refine {} (latest {})", reply.id, self.latest_refine);
                    return None;
                }
            }
            Operation::SpotHeal(layer_id) => {
                let last = self.last_applied_heal.get(&layer_id).copied().unwrap_or(0);
                if reply.id < last {
                    crate::log_info!("Dropping stale spot heal {} on layer {} (applied {})", reply.id, layer_id, last);
                    return None;
                }
                if matches!(reply.response, WorkerResponse::Pixels { .. }) {
                    self.last_applied_heal.insert(layer_id, reply.id);
                }
            }
        }
        Some(reply)
    }
}
