//! Note aggregate hosted by the node as a working example.

use common::AggregateId;
use domain::{Aggregate, Command, CommandHandlers, DomainEvent, EventHandlers};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum NoteEvent {
    Created { title: String },
    TitleChanged { title: String },
}

impl DomainEvent for NoteEvent {
    fn event_type(&self) -> &'static str {
        match self {
            NoteEvent::Created { .. } => "NoteCreated",
            NoteEvent::TitleChanged { .. } => "NoteTitleChanged",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub title: String,
    pub created: bool,
}

impl Note {
    fn on_created(&mut self, event: &NoteEvent) {
        if let NoteEvent::Created { title } = event {
            self.title = title.clone();
            self.created = true;
        }
    }

    fn on_title_changed(&mut self, event: &NoteEvent) {
        if let NoteEvent::TitleChanged { title } = event {
            self.title = title.clone();
        }
    }
}

impl Aggregate for Note {
    type Event = NoteEvent;

    fn aggregate_type() -> &'static str {
        "Note"
    }

    fn event_handlers() -> EventHandlers<Self> {
        EventHandlers::new()
            .on("NoteCreated", Note::on_created)
            .on("NoteTitleChanged", Note::on_title_changed)
    }
}

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("note already exists")]
    AlreadyCreated,
    #[error("title must not be empty")]
    EmptyTitle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNote {
    pub note_id: String,
    pub title: String,
}

impl Command for CreateNote {
    type Aggregate = Note;

    fn command_type() -> &'static str {
        "CreateNote"
    }

    fn aggregate_id(&self) -> AggregateId {
        AggregateId::from(self.note_id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNoteTitle {
    pub note_id: String,
    pub title: String,
}

impl Command for ChangeNoteTitle {
    type Aggregate = Note;

    fn command_type() -> &'static str {
        "ChangeNoteTitle"
    }

    fn aggregate_id(&self) -> AggregateId {
        AggregateId::from(self.note_id.as_str())
    }
}

/// Command handlers for [`Note`]. Setting the current title again is a no-op.
pub fn note_handlers() -> CommandHandlers<Note> {
    CommandHandlers::new()
        .creating::<CreateNote, _, _>(|note, cmd| {
            if note.created {
                return Err(NoteError::AlreadyCreated);
            }
            if cmd.title.trim().is_empty() {
                return Err(NoteError::EmptyTitle);
            }
            Ok(vec![NoteEvent::Created {
                title: cmd.title.clone(),
            }])
        })
        .on::<ChangeNoteTitle, _, _>(|note, cmd| {
            if cmd.title.trim().is_empty() {
                return Err(NoteError::EmptyTitle);
            }
            if note.title == cmd.title {
                return Ok(vec![]);
            }
            Ok(vec![NoteEvent::TitleChanged {
                title: cmd.title.clone(),
            }])
        })
}
