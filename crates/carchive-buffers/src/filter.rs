use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use carchive_core::BufferId;
use carchive_store::{BufferItemSpec, StoreError};

use crate::resolver::{resolve_ref, ResolvedEntity};
use crate::{BufferEngine, BufferOpResult, OpTarget};

/// Predicate over resolved buffer items. All set criteria must hold for an
/// item to pass; an unset criterion matches everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    /// Exact role match, case-insensitive. Kinds without a role never match.
    pub role: Option<String>,
    /// Case-insensitive substring of the item's content (title for
    /// conversations). Items without content never match.
    pub content: Option<String>,
    /// Keep items created within the last N days. Must be non-negative.
    pub days: Option<i64>,
    /// Keep only items with (or without) attached media.
    pub has_media: Option<bool>,
    /// Entity ids to exclude regardless of kind.
    pub exclude_ids: Vec<String>,
}

impl FilterCriteria {
    fn validate(&self) -> Result<(), StoreError> {
        if let Some(days) = self.days {
            if days < 0 {
                return Err(StoreError::InvalidInput(format!(
                    "days must be non-negative, got {days}"
                )));
            }
        }
        Ok(())
    }

    fn matches(&self, item: &ResolvedEntity) -> bool {
        if self.exclude_ids.iter().any(|id| id == item.entity.id_str()) {
            return false;
        }
        if let Some(role) = &self.role {
            match &item.role {
                Some(r) if r.eq_ignore_ascii_case(role) => {}
                _ => return false,
            }
        }
        if let Some(needle) = &self.content {
            match &item.content {
                Some(content)
                    if content.to_lowercase().contains(&needle.to_lowercase()) => {}
                _ => return false,
            }
        }
        if let Some(days) = self.days {
            // A window too large to represent as a cutoff covers all time.
            let cutoff = Duration::try_days(days)
                .and_then(|window| Utc::now().checked_sub_signed(window));
            if let Some(cutoff) = cutoff {
                if item.created_at < cutoff {
                    return false;
                }
            }
        }
        if let Some(wanted) = self.has_media {
            if item.has_media != wanted {
                return false;
            }
        }
        true
    }
}

impl BufferEngine {
    /// Filter a buffer's resolved items and write the survivors to `target`.
    /// The default name for a new buffer is `{source}_filtered`; dangling
    /// source items are skipped.
    #[instrument(skip(self, criteria, target), fields(source = %source))]
    pub fn filter(
        &self,
        source: &BufferId,
        criteria: &FilterCriteria,
        target: &OpTarget,
    ) -> Result<BufferOpResult, StoreError> {
        criteria.validate()?;
        let origin = self.require_buffer(source)?;

        let mut kept: Vec<BufferItemSpec> = Vec::new();
        for item in self.buffers().list_items(source)? {
            match resolve_ref(self.reader(), &item.entity)? {
                Some(resolved) if criteria.matches(&resolved) => kept.push(BufferItemSpec {
                    entity: item.entity,
                    position: None,
                    metadata: item.metadata,
                }),
                Some(_) => {}
                None => {
                    warn!(entity = %item.entity, "unresolvable item skipped during filter");
                }
            }
        }

        let default_name = format!("{}_filtered", origin.name);
        self.commit_items(target, &default_name, &origin, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{buffer_of, engine, item_refs};
    use carchive_core::EntityRef;
    use carchive_store::{BufferKind, NewBuffer};
    use chrono::Duration;

    #[test]
    fn role_filter_is_case_insensitive() {
        let (engine, archive) = engine();
        let user = archive.insert_message(None, "User", Some("question"), Utc::now()).unwrap();
        let asst = archive
            .insert_message(None, "assistant", Some("answer"), Utc::now())
            .unwrap();
        let buffer = buffer_of(
            &engine,
            "chat",
            &[EntityRef::Message(user.clone()), EntityRef::Message(asst)],
        );

        let criteria = FilterCriteria {
            role: Some("user".into()),
            ..Default::default()
        };
        let result = engine
            .filter(&buffer.id, &criteria, &OpTarget::new_default())
            .unwrap();

        let refs = item_refs(&engine, result.buffer_id());
        assert_eq!(refs, vec![EntityRef::Message(user)]);
    }

    #[test]
    fn content_filter_is_substring_case_insensitive() {
        let (engine, archive) = engine();
        let hit = archive
            .insert_message(None, "user", Some("Deploy to PRODUCTION today"), Utc::now())
            .unwrap();
        let miss = archive
            .insert_message(None, "user", Some("lunch plans"), Utc::now())
            .unwrap();
        let none = archive.insert_message(None, "user", None, Utc::now()).unwrap();
        let buffer = buffer_of(
            &engine,
            "all",
            &[
                EntityRef::Message(hit.clone()),
                EntityRef::Message(miss),
                EntityRef::Message(none),
            ],
        );

        let criteria = FilterCriteria {
            content: Some("production".into()),
            ..Default::default()
        };
        let result = engine
            .filter(&buffer.id, &criteria, &OpTarget::new_default())
            .unwrap();
        assert_eq!(item_refs(&engine, result.buffer_id()), vec![EntityRef::Message(hit)]);
    }

    #[test]
    fn conversation_content_matches_title() {
        let (engine, archive) = engine();
        let conv = archive
            .insert_conversation(Some("Quarterly review"), Utc::now())
            .unwrap();
        let buffer = buffer_of(&engine, "convs", &[EntityRef::Conversation(conv.clone())]);

        let criteria = FilterCriteria {
            content: Some("quarterly".into()),
            ..Default::default()
        };
        let result = engine
            .filter(&buffer.id, &criteria, &OpTarget::new_default())
            .unwrap();
        assert_eq!(
            item_refs(&engine, result.buffer_id()),
            vec![EntityRef::Conversation(conv)]
        );
    }

    #[test]
    fn days_filter_keeps_recent() {
        let (engine, archive) = engine();
        let old = archive
            .insert_message(None, "user", Some("stale"), Utc::now() - Duration::days(30))
            .unwrap();
        let recent = archive.insert_message(None, "user", Some("fresh"), Utc::now()).unwrap();
        let buffer = buffer_of(
            &engine,
            "aged",
            &[EntityRef::Message(old), EntityRef::Message(recent.clone())],
        );

        let criteria = FilterCriteria {
            days: Some(7),
            ..Default::default()
        };
        let result = engine
            .filter(&buffer.id, &criteria, &OpTarget::new_default())
            .unwrap();
        assert_eq!(item_refs(&engine, result.buffer_id()), vec![EntityRef::Message(recent)]);
    }

    #[test]
    fn huge_days_window_matches_everything() {
        let (engine, archive) = engine();
        let old = archive
            .insert_message(None, "user", Some("ancient"), Utc::now() - Duration::days(10_000))
            .unwrap();
        let buffer = buffer_of(&engine, "deep", &[EntityRef::Message(old.clone())]);

        let criteria = FilterCriteria {
            days: Some(i64::MAX),
            ..Default::default()
        };
        let result = engine
            .filter(&buffer.id, &criteria, &OpTarget::new_default())
            .unwrap();
        assert_eq!(item_refs(&engine, result.buffer_id()), vec![EntityRef::Message(old)]);
    }

    #[test]
    fn negative_days_rejected_before_io() {
        let (engine, _archive) = engine();
        let criteria = FilterCriteria {
            days: Some(-1),
            ..Default::default()
        };
        // Validation fires before the source buffer is even looked up.
        let err = engine
            .filter(&BufferId::from_raw("buf_x"), &criteria, &OpTarget::new_default())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[test]
    fn has_media_filter() {
        let (engine, archive) = engine();
        let plain = archive.insert_message(None, "user", Some("text"), Utc::now()).unwrap();
        let pictured = archive.insert_message(None, "user", Some("photo"), Utc::now()).unwrap();
        archive.attach_media(&pictured, "image", "/tmp/p.png").unwrap();
        let buffer = buffer_of(
            &engine,
            "mixed",
            &[EntityRef::Message(plain), EntityRef::Message(pictured.clone())],
        );

        let criteria = FilterCriteria {
            has_media: Some(true),
            ..Default::default()
        };
        let result = engine
            .filter(&buffer.id, &criteria, &OpTarget::new_default())
            .unwrap();
        assert_eq!(item_refs(&engine, result.buffer_id()), vec![EntityRef::Message(pictured)]);
    }

    #[test]
    fn exclude_ids_drop_matching_entities() {
        let (engine, archive) = engine();
        let keep = archive.insert_message(None, "user", Some("a"), Utc::now()).unwrap();
        let drop = archive.insert_message(None, "user", Some("b"), Utc::now()).unwrap();
        let buffer = buffer_of(
            &engine,
            "pruned",
            &[EntityRef::Message(keep.clone()), EntityRef::Message(drop.clone())],
        );

        let criteria = FilterCriteria {
            exclude_ids: vec![drop.as_str().to_string()],
            ..Default::default()
        };
        let result = engine
            .filter(&buffer.id, &criteria, &OpTarget::new_default())
            .unwrap();
        assert_eq!(item_refs(&engine, result.buffer_id()), vec![EntityRef::Message(keep)]);
    }

    #[test]
    fn default_name_appends_filtered_suffix() {
        let (engine, archive) = engine();
        let msg = archive.insert_message(None, "user", Some("x"), Utc::now()).unwrap();
        let buffer = buffer_of(&engine, "search", &[EntityRef::Message(msg)]);

        let result = engine
            .filter(&buffer.id, &FilterCriteria::default(), &OpTarget::new_default())
            .unwrap();
        match result {
            BufferOpResult::Created(row) => assert_eq!(row.name, "search_filtered"),
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn new_buffer_inherits_kind_and_scope() {
        let (engine, archive) = engine();
        let msg = archive.insert_message(None, "user", Some("x"), Utc::now()).unwrap();

        let mut spec = NewBuffer::named("scoped");
        spec.kind = BufferKind::Persistent;
        spec.session_scope = Some("cli-9".into());
        spec.items = vec![carchive_store::BufferItemSpec::new(EntityRef::Message(msg))];
        let buffer = engine.buffers().create(&spec).unwrap();

        let result = engine
            .filter(&buffer.id, &FilterCriteria::default(), &OpTarget::new_default())
            .unwrap();
        match result {
            BufferOpResult::Created(row) => {
                assert_eq!(row.kind, BufferKind::Persistent);
                assert_eq!(row.session_scope.as_deref(), Some("cli-9"));
            }
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn filter_into_existing_buffer_appends_with_dedup() {
        let (engine, archive) = engine();
        let a = archive.insert_message(None, "user", Some("a"), Utc::now()).unwrap();
        let b = archive.insert_message(None, "user", Some("b"), Utc::now()).unwrap();
        let source = buffer_of(
            &engine,
            "src",
            &[EntityRef::Message(a.clone()), EntityRef::Message(b)],
        );
        let target = buffer_of(&engine, "dst", &[EntityRef::Message(a)]);

        let result = engine
            .filter(
                &source.id,
                &FilterCriteria::default(),
                &OpTarget::Buffer(target.id.clone()),
            )
            .unwrap();
        match result {
            BufferOpResult::Appended { inserted, .. } => assert_eq!(inserted, 1),
            other => panic!("expected Appended, got {other:?}"),
        }
        assert_eq!(engine.buffers().count_items(&target.id).unwrap(), 2);
    }

    #[test]
    fn empty_result_still_creates_buffer() {
        let (engine, archive) = engine();
        let msg = archive.insert_message(None, "user", Some("x"), Utc::now()).unwrap();
        let buffer = buffer_of(&engine, "src", &[EntityRef::Message(msg)]);

        let criteria = FilterCriteria {
            role: Some("nonexistent".into()),
            ..Default::default()
        };
        let result = engine
            .filter(&buffer.id, &criteria, &OpTarget::new_default())
            .unwrap();
        assert_eq!(engine.buffers().count_items(result.buffer_id()).unwrap(), 0);
        assert!(engine.buffers().get(result.buffer_id()).unwrap().is_some());
    }
}
