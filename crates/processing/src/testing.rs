//! Counter aggregate shared by the unit tests of this crate.

use common::AggregateId;
use domain::{Aggregate, Command, CommandHandlers, DomainEvent, EventHandlers};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CounterEvent {
    Incremented { by: i64 },
    Reset,
}

impl DomainEvent for CounterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CounterEvent::Incremented { .. } => "Incremented",
            CounterEvent::Reset => "Reset",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
}

impl Counter {
    fn on_incremented(&mut self, event: &CounterEvent) {
        if let CounterEvent::Incremented { by } = event {
            self.value += by;
        }
    }

    fn on_reset(&mut self, _event: &CounterEvent) {
        self.value = 0;
    }
}

impl Aggregate for Counter {
    type Event = CounterEvent;

    fn aggregate_type() -> &'static str {
        "Counter"
    }

    fn event_handlers() -> EventHandlers<Self> {
        EventHandlers::new()
            .on("Incremented", Counter::on_incremented)
            .on("Reset", Counter::on_reset)
    }
}

/// Adds to a counter, creating it on first use. Rejects non-positive steps.
#[derive(Debug, Serialize, Deserialize)]
pub struct Increment {
    pub counter_id: String,
    pub by: i64,
}

impl Command for Increment {
    type Aggregate = Counter;

    fn command_type() -> &'static str {
        "Increment"
    }

    fn aggregate_id(&self) -> AggregateId {
        AggregateId::from(self.counter_id.as_str())
    }
}

/// Resets an existing counter. Raises nothing when it is already zero.
#[derive(Debug, Serialize, Deserialize)]
pub struct Reset {
    pub counter_id: String,
}

impl Command for Reset {
    type Aggregate = Counter;

    fn command_type() -> &'static str {
        "Reset"
    }

    fn aggregate_id(&self) -> AggregateId {
        AggregateId::from(self.counter_id.as_str())
    }
}

pub fn counter_handlers() -> CommandHandlers<Counter> {
    CommandHandlers::new()
        .creating::<Increment, _, _>(|_state, cmd| {
            if cmd.by <= 0 {
                return Err(format!("step must be positive, got {}", cmd.by));
            }
            Ok(vec![CounterEvent::Incremented { by: cmd.by }])
        })
        .on::<Reset, _, _>(|state, _cmd| {
            if state.value == 0 {
                return Ok::<_, String>(vec![]);
            }
            Ok(vec![CounterEvent::Reset])
        })
}

pub fn increment(id: &str, by: i64) -> Increment {
    Increment {
        counter_id: id.to_string(),
        by,
    }
}

pub fn reset(id: &str) -> Reset {
    Reset {
        counter_id: id.to_string(),
    }
}
