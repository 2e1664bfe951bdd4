//! Coalesces redundant queued commands so fewer commands achieve the same
//! end state. Naive per-edit transmission floods the wire; merging turns
//! O(edits) into O(distinct targets) traffic while the receiver observes
//! an identical final state.

use tidepool_proto::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No applicable merge; the command was appended to the buffer.
    Appended,
    /// The command was folded into the queued entry at this index.
    MergedInto(usize),
    /// The merge produced a true no-op and the queued entry was dropped.
    Collapsed,
}

/// Merges `incoming` into `buffer`, preserving the net observable effect
/// of the original sequence.
///
/// Value changes on distinct `(bean, attribute)` targets commute, so a
/// `ValueChanged` may fold into a matching entry anywhere in the buffer.
/// Structural list edits on the same list do not commute across
/// interleavings, so list commands only ever merge with the final buffer
/// entry.
pub fn merge_into(buffer: &mut Vec<Command>, incoming: Command) -> MergeOutcome {
    match incoming {
        Command::ValueChanged {
            bean_id,
            attribute,
            old_value,
            new_value,
        } => {
            for (index, queued) in buffer.iter_mut().enumerate() {
                let Command::ValueChanged {
                    bean_id: queued_bean,
                    attribute: queued_attribute,
                    old_value: queued_old,
                    ..
                } = queued
                else {
                    continue;
                };
                if *queued_bean != bean_id || *queued_attribute != attribute {
                    continue;
                }
                // Keep the earliest old value in the chain; only the most
                // recent new value matters.
                if *queued_old == new_value {
                    buffer.remove(index);
                    return MergeOutcome::Collapsed;
                }
                *queued = Command::ValueChanged {
                    bean_id,
                    attribute,
                    old_value: queued_old.clone(),
                    new_value,
                };
                return MergeOutcome::MergedInto(index);
            }
            buffer.push(Command::ValueChanged {
                bean_id,
                attribute,
                old_value,
                new_value,
            });
            MergeOutcome::Appended
        }
        Command::ListAdd {
            list_id,
            index,
            values,
        } => {
            if let Some(Command::ListAdd {
                list_id: queued_list,
                index: queued_index,
                values: queued_values,
            }) = buffer.last_mut()
            {
                // An insert landing inside or directly after the queued
                // span splices into it: add(3,[a]) + add(4,[b]) = add(3,[a,b]).
                if *queued_list == list_id
                    && index >= *queued_index
                    && index <= *queued_index + queued_values.len()
                {
                    let offset = index - *queued_index;
                    queued_values.splice(offset..offset, values);
                    return MergeOutcome::MergedInto(buffer.len() - 1);
                }
            }
            buffer.push(Command::ListAdd {
                list_id,
                index,
                values,
            });
            MergeOutcome::Appended
        }
        Command::ListRemove {
            list_id,
            index,
            count,
        } => {
            if let Some(Command::ListRemove {
                list_id: queued_list,
                index: queued_index,
                count: queued_count,
            }) = buffer.last_mut()
            {
                // The second remove runs against the already-shifted list;
                // whenever its range reaches up to the first one's start
                // the union is one contiguous original range.
                if *queued_list == list_id && index <= *queued_index && *queued_index <= index + count
                {
                    *queued_index = index;
                    *queued_count += count;
                    return MergeOutcome::MergedInto(buffer.len() - 1);
                }
            }
            buffer.push(Command::ListRemove {
                list_id,
                index,
                count,
            });
            MergeOutcome::Appended
        }
        Command::ListReplace {
            list_id,
            index,
            values,
        } => {
            if let Some(Command::ListReplace {
                list_id: queued_list,
                index: queued_index,
                values: queued_values,
            }) = buffer.last_mut()
            {
                let queued_end = *queued_index + queued_values.len();
                let incoming_end = index + values.len();
                // Replace does not shift indices; touching or overlapping
                // ranges fold into one, the most recent value winning.
                if *queued_list == list_id && index <= queued_end && *queued_index <= incoming_end {
                    let start = (*queued_index).min(index);
                    let end = queued_end.max(incoming_end);
                    let mut merged = Vec::with_capacity(end - start);
                    for position in start..end {
                        if position >= index && position < incoming_end {
                            merged.push(values[position - index].clone());
                        } else {
                            merged.push(queued_values[position - *queued_index].clone());
                        }
                    }
                    *queued_index = start;
                    *queued_values = merged;
                    return MergeOutcome::MergedInto(buffer.len() - 1);
                }
            }
            buffer.push(Command::ListReplace {
                list_id,
                index,
                values,
            });
            MergeOutcome::Appended
        }
        other => {
            buffer.push(other);
            MergeOutcome::Appended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_proto::{BeanId, ListId, PmValue};

    fn value_changed(bean: u64, attribute: &str, old: i64, new: i64) -> Command {
        Command::ValueChanged {
            bean_id: BeanId(bean),
            attribute: attribute.into(),
            old_value: PmValue::Int(old),
            new_value: PmValue::Int(new),
        }
    }

    fn texts(values: &[&str]) -> Vec<PmValue> {
        values.iter().map(|value| PmValue::Text((*value).into())).collect()
    }

    #[test]
    fn value_changes_fold_keeping_earliest_old_value() {
        let mut buffer = Vec::new();
        merge_into(&mut buffer, value_changed(1, "x", 0, 1));
        let outcome = merge_into(&mut buffer, value_changed(1, "x", 1, 2));
        assert_eq!(outcome, MergeOutcome::MergedInto(0));
        assert_eq!(buffer, vec![value_changed(1, "x", 0, 2)]);
    }

    #[test]
    fn value_change_back_to_origin_collapses() {
        let mut buffer = Vec::new();
        merge_into(&mut buffer, value_changed(1, "x", 0, 1));
        let outcome = merge_into(&mut buffer, value_changed(1, "x", 1, 0));
        assert_eq!(outcome, MergeOutcome::Collapsed);
        assert!(buffer.is_empty());
    }

    #[test]
    fn value_changes_fold_across_unrelated_entries() {
        let mut buffer = Vec::new();
        merge_into(&mut buffer, value_changed(1, "x", 0, 1));
        merge_into(&mut buffer, value_changed(2, "y", 5, 6));
        merge_into(&mut buffer, value_changed(1, "x", 1, 3));
        assert_eq!(
            buffer,
            vec![value_changed(1, "x", 0, 3), value_changed(2, "y", 5, 6)]
        );
    }

    #[test]
    fn distinct_attributes_do_not_merge() {
        let mut buffer = Vec::new();
        merge_into(&mut buffer, value_changed(1, "x", 0, 1));
        let outcome = merge_into(&mut buffer, value_changed(1, "y", 0, 1));
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn adjacent_list_adds_concatenate() {
        let mut buffer = Vec::new();
        merge_into(
            &mut buffer,
            Command::ListAdd {
                list_id: ListId(1),
                index: 3,
                values: texts(&["a"]),
            },
        );
        let outcome = merge_into(
            &mut buffer,
            Command::ListAdd {
                list_id: ListId(1),
                index: 4,
                values: texts(&["b"]),
            },
        );
        assert_eq!(outcome, MergeOutcome::MergedInto(0));
        assert_eq!(
            buffer,
            vec![Command::ListAdd {
                list_id: ListId(1),
                index: 3,
                values: texts(&["a", "b"]),
            }]
        );
    }

    #[test]
    fn list_add_inside_span_splices() {
        let mut buffer = vec![Command::ListAdd {
            list_id: ListId(1),
            index: 2,
            values: texts(&["a", "c"]),
        }];
        merge_into(
            &mut buffer,
            Command::ListAdd {
                list_id: ListId(1),
                index: 3,
                values: texts(&["b"]),
            },
        );
        assert_eq!(
            buffer,
            vec![Command::ListAdd {
                list_id: ListId(1),
                index: 2,
                values: texts(&["a", "b", "c"]),
            }]
        );
    }

    #[test]
    fn disjoint_list_adds_do_not_merge() {
        let mut buffer = vec![Command::ListAdd {
            list_id: ListId(1),
            index: 0,
            values: texts(&["a"]),
        }];
        let outcome = merge_into(
            &mut buffer,
            Command::ListAdd {
                list_id: ListId(1),
                index: 5,
                values: texts(&["b"]),
            },
        );
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn overlapping_removes_become_one_range() {
        let mut buffer = vec![Command::ListRemove {
            list_id: ListId(1),
            index: 4,
            count: 2,
        }];
        // removing [2,5) of the shifted list reaches the first range
        let outcome = merge_into(
            &mut buffer,
            Command::ListRemove {
                list_id: ListId(1),
                index: 2,
                count: 3,
            },
        );
        assert_eq!(outcome, MergeOutcome::MergedInto(0));
        assert_eq!(
            buffer,
            vec![Command::ListRemove {
                list_id: ListId(1),
                index: 2,
                count: 5,
            }]
        );
    }

    #[test]
    fn repeated_remove_at_same_index_extends() {
        let mut buffer = Vec::new();
        for _ in 0..3 {
            merge_into(
                &mut buffer,
                Command::ListRemove {
                    list_id: ListId(1),
                    index: 2,
                    count: 1,
                },
            );
        }
        assert_eq!(
            buffer,
            vec![Command::ListRemove {
                list_id: ListId(1),
                index: 2,
                count: 3,
            }]
        );
    }

    #[test]
    fn gap_between_removes_appends() {
        let mut buffer = vec![Command::ListRemove {
            list_id: ListId(1),
            index: 0,
            count: 1,
        }];
        let outcome = merge_into(
            &mut buffer,
            Command::ListRemove {
                list_id: ListId(1),
                index: 4,
                count: 1,
            },
        );
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn overlapping_replaces_keep_most_recent_values() {
        let mut buffer = vec![Command::ListReplace {
            list_id: ListId(1),
            index: 2,
            values: texts(&["a", "b"]),
        }];
        merge_into(
            &mut buffer,
            Command::ListReplace {
                list_id: ListId(1),
                index: 3,
                values: texts(&["B", "C"]),
            },
        );
        assert_eq!(
            buffer,
            vec![Command::ListReplace {
                list_id: ListId(1),
                index: 2,
                values: texts(&["a", "B", "C"]),
            }]
        );
    }

    #[test]
    fn list_ops_only_merge_with_final_entry() {
        let mut buffer = Vec::new();
        merge_into(
            &mut buffer,
            Command::ListAdd {
                list_id: ListId(1),
                index: 0,
                values: texts(&["a"]),
            },
        );
        merge_into(
            &mut buffer,
            Command::ListRemove {
                list_id: ListId(1),
                index: 0,
                count: 1,
            },
        );
        // would splice into the first entry, but an intervening remove on
        // the same list forbids reordering
        let outcome = merge_into(
            &mut buffer,
            Command::ListAdd {
                list_id: ListId(1),
                index: 0,
                values: texts(&["b"]),
            },
        );
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn control_commands_always_append() {
        let mut buffer = vec![Command::StartLongPoll];
        let outcome = merge_into(&mut buffer, Command::StartLongPoll);
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(buffer.len(), 2);
    }
}
