use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::content::pack_content;
use super::schedule::{update_average, SchedulePolicy};
use crate::feed::ParsedFeed;
use crate::storage::{Feed, Story, StoryWrite};

/// How a reconciliation was triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Rewrite every incoming story, changed or not
    pub update_all: bool,
    /// The document arrived through a hub push
    pub from_push: bool,
    /// A reader just opened the feed
    pub mark_viewed: bool,
}

/// Outcome of reconciling one fetched document against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The feed claims no update since last time: only the feed row changes.
    AlreadyCurrent { feed: Feed },
    /// Feed row plus the stories that are new or changed.
    Write { feed: Feed, stories: Vec<StoryWrite> },
}

impl Decision {
    pub fn feed(&self) -> &Feed {
        match self {
            Decision::AlreadyCurrent { feed } | Decision::Write { feed, .. } => feed,
        }
    }

    pub fn story_writes(&self) -> &[StoryWrite] {
        match self {
            Decision::AlreadyCurrent { .. } => &[],
            Decision::Write { stories, .. } => stories,
        }
    }
}

/// Whether the incoming document can skip story diffing entirely.
///
/// True when the source declares an update time equal to the stored one and
/// nothing forces a full pass. Story edits published without bumping the
/// feed's update time are missed until the next real update.
pub fn is_already_current(previous: &Feed, incoming: &ParsedFeed, flags: Flags) -> bool {
    incoming.updated.is_some()
        && incoming.updated == previous.updated
        && !flags.update_all
        && !flags.from_push
}

/// Computes the write-set for `incoming` given the stored feed and the stored
/// versions of the incoming stories (`prior`, keyed by story id).
///
/// New stories are written as parsed. Known stories are rewritten only when
/// their claimed update time changed (or `update_all` is set), keeping the
/// stored `created` and `published` times.
pub fn reconcile(
    previous: &Feed,
    incoming: ParsedFeed,
    prior: &HashMap<String, Story>,
    flags: Flags,
    policy: &SchedulePolicy,
    now: DateTime<Utc>,
) -> Decision {
    let already_current = is_already_current(previous, &incoming, flags);
    let declared_update = incoming.updated;

    let mut feed = previous.clone();
    if !incoming.title.is_empty() {
        feed.title = incoming.title;
    }
    if !incoming.link.is_empty() {
        feed.link = incoming.link;
    }
    feed.hub = incoming.hub;
    if declared_update.is_some() {
        feed.updated = declared_update;
    }
    feed.errors = 0;
    feed.checked = Some(now);
    if flags.mark_viewed {
        feed.last_viewed = Some(now);
    }

    if already_current {
        feed.next_update = policy.next_update(&feed, now, false);
        return Decision::AlreadyCurrent { feed };
    }

    let mut stories = Vec::new();
    for parsed in incoming.stories {
        let mut story = parsed.story;
        match prior.get(&story.id) {
            None => {}
            Some(stored) => {
                let changed = story.updated.is_some() && story.updated != stored.updated;
                if !changed && !flags.update_all {
                    continue;
                }
                story.created = stored.created;
                story.published = stored.published;
            }
        }
        story.feed_url = feed.url.clone();
        let content = pack_content(&feed.url, &story.id, &parsed.content);
        stories.push(StoryWrite { story, content });
    }

    if !stories.is_empty() {
        feed.average = update_average(previous.average, previous.date, now, stories.len());
        feed.date = Some(now);
        if declared_update.is_none() {
            feed.updated = Some(now);
        }
    }

    feed.next_update = policy.next_update(&feed, now, flags.from_push);
    Decision::Write { feed, stories }
}
