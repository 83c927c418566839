// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Story text lookup.
//!
//! Story authoring, revisions and rich content live in an external system;
//! the coordination layer only needs the narration text to price and
//! synthesize, so this store is a plain id-to-text map fed by ingestion.

use crate::clock::SharedClock;
use crate::error::Error;
use crate::model::{Story, StoryId};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Store of narratable stories.
#[derive(Debug)]
pub struct StoryStore {
    clock: SharedClock,
    stories: Mutex<HashMap<StoryId, Story>>,
}

impl StoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self { clock, stories: Mutex::new(HashMap::new()) }
    }

    /// Adds or replaces a story.
    pub fn put(&self, story_id: StoryId, title: impl Into<String>, text: impl Into<String>) {
        let story = Story {
            story_id: story_id.clone(),
            title: title.into(),
            text: text.into(),
            created_at: self.clock.now(),
        };
        let _ = self.stories.lock().insert(story_id, story);
    }

    /// A snapshot of the story.
    pub fn get(&self, story_id: &StoryId) -> Result<Story, Error> {
        self.stories
            .lock()
            .get(story_id)
            .cloned()
            .ok_or_else(|| Error::NotFound { entity: "story", id: story_id.to_string() })
    }
}
