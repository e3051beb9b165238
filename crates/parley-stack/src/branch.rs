// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::{info, warn};

use parley_states::{Envelope, State};

use crate::keys;
use crate::stack::{decode_raw, new_short_id, InteractionStack, StackError};

impl InteractionStack {
    /// Fork the current branch at `index` (inclusive): entries `0..=index`
    /// are copied into a fresh 8-hex branch, the current-branch pointer is
    /// retargeted, and the switch is announced on the pointer's pub/sub
    /// channel.  The source branch is untouched.
    pub fn fork(&self, index: i64) -> Result<String, StackError> {
        let src = self.current_branch();
        let src_key = self.branch_key(&src);
        let length = self.context().store.llen(&src_key);
        if index < 0 || index >= length as i64 {
            return Err(StackError::IndexOutOfRange {
                index,
                branch: src.clone(),
                length,
            });
        }

        let dst = new_short_id();
        let dst_key = self.branch_key(&dst);
        let slice = self.context().store.lrange(&src_key, 0, index);
        if !slice.is_empty() {
            self.context().store.rpush(&dst_key, &slice);
            self.context()
                .store
                .expire(&dst_key, self.context().config.key_ttl_secs);
        }

        let ptr = self.pointer_key();
        self.context().store.set(&ptr, &dst);
        self.context().store.publish(&ptr, &dst);

        info!(from = src, to = dst, "forked branch");
        Ok(dst)
    }

    /// Retarget the current-branch pointer.  Fails unless the branch key
    /// exists (`"main"` always does).
    pub fn checkout(&self, branch_id: &str) -> Result<(), StackError> {
        if branch_id != "main" && !self.context().store.exists(&self.branch_key(branch_id)) {
            return Err(StackError::UnknownBranch(branch_id.to_string()));
        }
        self.context().store.set(&self.pointer_key(), branch_id);
        info!(branch_id, "checked out branch");
        Ok(())
    }

    /// Truncate the current branch to `0..=index`, cleaning up auxiliary
    /// pointers for any removed `ToolCall` entries.
    pub fn rewind(&self, index: i64) -> Result<(), StackError> {
        if index < 0 {
            return Err(StackError::IndexOutOfRange {
                index,
                branch: self.current_branch(),
                length: self.length(None),
            });
        }
        let branch = self.current_branch();
        let key = self.branch_key(&branch);
        let length = self.context().store.llen(&key);
        if index >= length as i64 {
            return Err(StackError::IndexOutOfRange {
                index,
                branch,
                length,
            });
        }

        let removed = self.context().store.lrange(&key, index + 1, -1);
        self.context().store.ltrim(&key, 0, index);
        self.context()
            .store
            .expire(&key, self.context().config.key_ttl_secs);

        for raw in removed {
            match decode_raw(&raw) {
                Ok(entry) => {
                    if let State::ToolCall { id, .. } = entry.state {
                        self.context().store.hdel(
                            &keys::toolcall_ref(self.conversation_id(), self.agent_id()),
                            &id,
                        );
                    }
                }
                Err(e) => {
                    // Fall back to the raw envelope tag so a corrupt data
                    // field cannot leak dangling pointers.
                    warn!(error = %e, "rewound entry failed to decode");
                    if let Ok(env) = serde_json::from_str::<Envelope>(&raw) {
                        if env.t == "tool_call" {
                            if let Some(id) = env.data.get("id").and_then(|v| v.as_str()) {
                                self.context().store.hdel(
                                    &keys::toolcall_ref(self.conversation_id(), self.agent_id()),
                                    id,
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use crate::stack::tests::test_context;
    use crate::stack::StackContext;
    use crate::InteractionStack;

    use super::*;

    fn stack(ctx: &StackContext) -> InteractionStack {
        InteractionStack::new(ctx.clone(), "c1", "a1")
    }

    fn seeded(ctx: &StackContext) -> InteractionStack {
        let s = stack(ctx);
        let mut args = Map::new();
        args.insert("x".into(), json!(1));
        s.push(&[
            State::user("u"),
            State::assistant("a"),
            State::ToolCall {
                id: "h1".into(),
                function_name: "echo".into(),
                arguments: args,
            },
        ]);
        s
    }

    #[test]
    fn fork_copies_prefix_and_switches_pointer() {
        let (ctx, _) = test_context();
        let s = seeded(&ctx);
        let forked = s.fork(1).unwrap();
        assert_eq!(forked.len(), 8);
        assert_eq!(s.current_branch(), forked);
        assert_eq!(s.length(None), 2);
        assert_eq!(s.length(Some("main")), 3);
        // main is unchanged
        assert_eq!(s.at(2, Some("main")).unwrap().state.tag(), "tool_call");
    }

    #[test]
    fn fork_announces_on_pointer_channel() {
        let (ctx, _) = test_context();
        let s = seeded(&ctx);
        let mut rx = ctx.store.subscribe(&keys::branch_pointer("c1", "a1"));
        let forked = s.fork(0).unwrap();
        assert_eq!(rx.try_recv().unwrap(), forked);
    }

    #[test]
    fn fork_out_of_range_fails() {
        let (ctx, _) = test_context();
        let s = seeded(&ctx);
        assert!(s.fork(3).is_err());
        assert!(s.fork(-1).is_err());
    }

    #[test]
    fn forked_branch_diverges_independently() {
        let (ctx, _) = test_context();
        let s = seeded(&ctx);
        s.fork(1).unwrap();
        s.push(&[State::user("alt")]);
        assert_eq!(s.length(None), 3);
        assert_eq!(s.length(Some("main")), 3);
        assert_eq!(s.current(None).unwrap().state, State::user("alt"));
        assert_eq!(s.at(2, Some("main")).unwrap().state.tag(), "tool_call");
    }

    #[test]
    fn checkout_requires_existing_branch() {
        let (ctx, _) = test_context();
        let s = seeded(&ctx);
        assert!(matches!(
            s.checkout("deadbeef"),
            Err(StackError::UnknownBranch(_))
        ));
        let forked = s.fork(0).unwrap();
        s.checkout("main").unwrap();
        assert_eq!(s.current_branch(), "main");
        s.checkout(&forked).unwrap();
        assert_eq!(s.current_branch(), forked);
    }

    #[test]
    fn rewind_truncates_and_preserves_prefix() {
        let (ctx, _) = test_context();
        let s = seeded(&ctx);
        let before = s.at(1, None).unwrap().state;
        s.rewind(1).unwrap();
        assert_eq!(s.length(None), 2);
        assert_eq!(s.at(1, None).unwrap().state, before);
        assert!(s.rewind(5).is_err());
    }

    #[test]
    fn rewind_cleans_tool_call_refs() {
        let (ctx, _) = test_context();
        let s = seeded(&ctx);
        assert!(ctx.store.hget(&keys::toolcall_ref("c1", "a1"), "h1").is_some());
        s.rewind(1).unwrap();
        assert!(ctx.store.hget(&keys::toolcall_ref("c1", "a1"), "h1").is_none());
    }

    #[test]
    fn branch_info_lists_all_branches_sorted() {
        let (ctx, _) = test_context();
        let s = seeded(&ctx);
        let forked = s.fork(0).unwrap();
        let info = s.get_branch_info();
        assert_eq!(info.len(), 2);
        let ids: Vec<&str> = info.iter().map(|b| b.branch_id.as_str()).collect();
        assert!(ids.contains(&"main"));
        assert!(ids.contains(&forked.as_str()));
        let current: Vec<bool> = info.iter().map(|b| b.is_current).collect();
        assert_eq!(current.iter().filter(|c| **c).count(), 1);
        assert!(info.windows(2).all(|w| w[0].branch_id <= w[1].branch_id));
    }
}
