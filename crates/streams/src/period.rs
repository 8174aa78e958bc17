//! Stream period tracking.
//!
//! Each flow edge `(sender, receiver, token)` carries two monotonic counters:
//! the stream revision, bumped when the flow terminates, and the period
//! revision, bumped whenever an open period closes. The id of the period an
//! edge currently has open is derived from those counters, so periods never
//! point back at their edge.

use std::collections::{HashMap, HashSet};
use std::fmt;

use alloy_primitives::{Address, I256};
use thiserror::Error;

use crate::{FlowActionType, FlowRate};

/// Identity of a flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowEdgeKey {
    pub token: Address,
    pub sender: Address,
    pub receiver: Address,
}

impl FlowEdgeKey {
    pub fn new(token: Address, sender: Address, receiver: Address) -> Self {
        Self {
            token,
            sender,
            receiver,
        }
    }

    /// Storage id of the edge: `sender-receiver-token`.
    pub fn id(&self) -> String {
        format!("{:#x}-{:#x}-{:#x}", self.sender, self.receiver, self.token)
    }

    /// Id of the stream living on this edge at `revision_index`.
    pub fn stream_id(&self, revision_index: u32) -> String {
        format!("{}-{revision_index}", self.id())
    }
}

impl fmt::Display for FlowEdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Where in the event stream something happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPosition {
    /// `txhash-logindex`.
    pub id: String,
    pub block_number: u64,
    pub timestamp: u64,
}

/// A `FlowUpdated` event reduced to what the tracker needs.
#[derive(Debug, Clone)]
pub struct FlowUpdate {
    pub edge: FlowEdgeKey,
    pub flow_rate: FlowRate,
    pub at: EventPosition,
}

/// Current state of a flow edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEdge {
    pub key: FlowEdgeKey,
    pub flow_rate: FlowRate,
    pub revision_index: u32,
    pub period_revision_index: u32,
    pub streamed_until_updated_at: I256,
    pub created_at_timestamp: u64,
    pub updated_at_timestamp: u64,
    pub updated_at_block: u64,
}

impl FlowEdge {
    /// An edge with no flow yet, first seen at `at`.
    pub fn new(key: FlowEdgeKey, at: &EventPosition) -> Self {
        Self {
            key,
            flow_rate: 0,
            revision_index: 0,
            period_revision_index: 0,
            streamed_until_updated_at: I256::ZERO,
            created_at_timestamp: at.timestamp,
            updated_at_timestamp: at.timestamp,
            updated_at_block: at.block_number,
        }
    }

    pub fn stream_id(&self) -> String {
        self.key.stream_id(self.revision_index)
    }

    /// Id the edge's open period has (or would have).
    pub fn open_period_id(&self) -> StreamPeriodId {
        StreamPeriodId {
            stream_id: self.stream_id(),
            period_revision_index: self.period_revision_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamPeriodId {
    pub stream_id: String,
    pub period_revision_index: u32,
}

impl fmt::Display for StreamPeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stream_id, self.period_revision_index)
    }
}

/// An interval during which an edge's rate was constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPeriod {
    pub id: StreamPeriodId,
    pub edge: FlowEdgeKey,
    pub flow_rate: FlowRate,
    pub started_at: EventPosition,
    pub stopped_at: Option<EventPosition>,
    /// Set on close only.
    pub total_amount_streamed: Option<I256>,
}

impl StreamPeriod {
    pub fn is_open(&self) -> bool {
        self.stopped_at.is_none()
    }
}

/// Result of applying one flow update.
#[derive(Debug, Clone)]
pub struct Transition {
    pub action: FlowActionType,
    pub closed: Option<StreamPeriod>,
    pub opened: Option<StreamPeriod>,
    pub edge: FlowEdge,
}

/// Structural violations. Any of these halts the edge it names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("{action} on edge {edge} without open stream period {expected}")]
    NoOpenPeriod {
        edge: FlowEdgeKey,
        action: FlowActionType,
        expected: StreamPeriodId,
    },
    #[error("edge {edge}: event at {got} precedes last update at {last}")]
    NonMonotonic { edge: FlowEdgeKey, last: u64, got: u64 },
    #[error("edge {edge}: flow rate update from zero to zero")]
    NoTransition { edge: FlowEdgeKey },
    #[error("edge {edge}: streamed amount overflowed")]
    Overflow { edge: FlowEdgeKey },
    #[error("edge {edge} is halted by an earlier structural violation")]
    Halted { edge: FlowEdgeKey },
}

impl TrackerError {
    pub fn edge(&self) -> &FlowEdgeKey {
        match self {
            TrackerError::NoOpenPeriod { edge, .. }
            | TrackerError::NonMonotonic { edge, .. }
            | TrackerError::NoTransition { edge }
            | TrackerError::Overflow { edge }
            | TrackerError::Halted { edge } => edge,
        }
    }
}

/// `flow_rate * elapsed`, exact.
pub fn streamed_amount(flow_rate: FlowRate, elapsed: u64) -> Option<I256> {
    let rate = I256::try_from(flow_rate).ok()?;
    let elapsed = I256::try_from(elapsed).ok()?;
    rate.checked_mul(elapsed)
}

/// Per-edge state machine opening and closing stream periods.
#[derive(Debug, Default)]
pub struct StreamPeriodTracker {
    edges: HashMap<FlowEdgeKey, FlowEdge>,
    open: HashMap<StreamPeriodId, StreamPeriod>,
    halted: HashSet<FlowEdgeKey>,
}

impl StreamPeriodTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from persisted edges, their open periods, and the
    /// edges an earlier structural violation halted.
    pub fn restore(
        edges: impl IntoIterator<Item = FlowEdge>,
        open_periods: impl IntoIterator<Item = StreamPeriod>,
        halted: impl IntoIterator<Item = FlowEdgeKey>,
    ) -> Self {
        Self {
            edges: edges.into_iter().map(|e| (e.key, e)).collect(),
            open: open_periods
                .into_iter()
                .filter(StreamPeriod::is_open)
                .map(|p| (p.id.clone(), p))
                .collect(),
            halted: halted.into_iter().collect(),
        }
    }

    pub fn edge(&self, key: &FlowEdgeKey) -> Option<&FlowEdge> {
        self.edges.get(key)
    }

    pub fn edges(&self) -> impl Iterator<Item = &FlowEdge> {
        self.edges.values()
    }

    pub fn open_period(&self, key: &FlowEdgeKey) -> Option<&StreamPeriod> {
        let edge = self.edges.get(key)?;
        self.open.get(&edge.open_period_id())
    }

    pub fn is_halted(&self, key: &FlowEdgeKey) -> bool {
        self.halted.contains(key)
    }

    /// Apply a flow update to its edge.
    ///
    /// On error the edge is left untouched and halted; later updates to it
    /// fail with [`TrackerError::Halted`]. Other edges are unaffected.
    pub fn apply(&mut self, update: &FlowUpdate) -> Result<Transition, TrackerError> {
        let key = update.edge;
        if self.halted.contains(&key) {
            return Err(TrackerError::Halted { edge: key });
        }

        let mut edge = self
            .edges
            .get(&key)
            .cloned()
            .unwrap_or_else(|| FlowEdge::new(key, &update.at));

        let Some(elapsed) = update.at.timestamp.checked_sub(edge.updated_at_timestamp) else {
            return Err(self.halt(TrackerError::NonMonotonic {
                edge: key,
                last: edge.updated_at_timestamp,
                got: update.at.timestamp,
            }));
        };
        let Some(action) = FlowActionType::classify(edge.flow_rate, update.flow_rate) else {
            return Err(self.halt(TrackerError::NoTransition { edge: key }));
        };

        let accrued = streamed_amount(edge.flow_rate, elapsed)
            .and_then(|a| edge.streamed_until_updated_at.checked_add(a));
        let Some(accrued) = accrued else {
            return Err(self.halt(TrackerError::Overflow { edge: key }));
        };
        edge.streamed_until_updated_at = accrued;

        let closed = match action {
            FlowActionType::Create => None,
            FlowActionType::Update | FlowActionType::Terminate => {
                let closed = self.close_open_period(&edge, action, &update.at)?;
                edge.period_revision_index += 1;
                if action == FlowActionType::Terminate {
                    edge.revision_index += 1;
                }
                Some(closed)
            }
        };

        edge.flow_rate = update.flow_rate;
        edge.updated_at_timestamp = update.at.timestamp;
        edge.updated_at_block = update.at.block_number;

        let opened = (action != FlowActionType::Terminate).then(|| {
            let period = StreamPeriod {
                id: edge.open_period_id(),
                edge: key,
                flow_rate: update.flow_rate,
                started_at: update.at.clone(),
                stopped_at: None,
                total_amount_streamed: None,
            };
            self.open.insert(period.id.clone(), period.clone());
            period
        });

        self.edges.insert(key, edge.clone());

        Ok(Transition {
            action,
            closed,
            opened,
            edge,
        })
    }

    fn close_open_period(
        &mut self,
        edge: &FlowEdge,
        action: FlowActionType,
        at: &EventPosition,
    ) -> Result<StreamPeriod, TrackerError> {
        let expected = edge.open_period_id();
        let Some(mut period) = self.open.remove(&expected) else {
            return Err(self.halt(TrackerError::NoOpenPeriod {
                edge: edge.key,
                action,
                expected,
            }));
        };

        let started = period.started_at.timestamp;
        let amount = at
            .timestamp
            .checked_sub(started)
            .and_then(|duration| streamed_amount(period.flow_rate, duration));
        let Some(amount) = amount else {
            self.open.insert(expected, period);
            let err = if at.timestamp < started {
                TrackerError::NonMonotonic {
                    edge: edge.key,
                    last: started,
                    got: at.timestamp,
                }
            } else {
                TrackerError::Overflow { edge: edge.key }
            };
            return Err(self.halt(err));
        };

        period.stopped_at = Some(at.clone());
        period.total_amount_streamed = Some(amount);
        Ok(period)
    }

    fn halt(&mut self, err: TrackerError) -> TrackerError {
        tracing::error!(edge = %err.edge(), error = %err, "Structural violation, halting edge");
        self.halted.insert(*err.edge());
        err
    }
}
