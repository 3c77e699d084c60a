/*
 * 5D Labs Node Labeller - File-driven Kubernetes Node labelling
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Node labeller core library
//!
//! Label definition files on disk describe which node label *values* make a node eligible for a
//! derived label. This crate keeps the parsed definitions, the per-node desired label state and
//! the live Node objects converged while files and nodes change underneath it.

pub mod config;
pub mod control;
pub mod definitions;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod state;
pub mod watcher;

// Re-export commonly used types
pub use config::{Config, LogFormat};
pub use control::{ControlLoop, Labeller};
pub use definitions::{DefinitionStore, LabelDefinitions};
pub use error::{Error, Result};
pub use events::{ingest, NodeEvent, NodeEventTranslator};
pub use reconciler::{NodeStore, ReconcileOutcome, Reconciler, LABEL_MARKER_VALUE};
pub use state::{LabelStatus, NodeLabelState};
pub use watcher::LabelWatcher;
