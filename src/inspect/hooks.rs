//! Hook classification.
//!
//! Debug builds of a runtime record the name of every hook a component called,
//! and that record wins when present. Otherwise each slot is matched against
//! [`HOOK_PREDICATES`], an ordered list of shape checks over the slot's
//! memoized state and update queue. Order matters: more specific shapes come
//! first (a reducer queue also has a `dispatch` function, a layout effect is
//! also an effect). These are heuristics and can misfire on unusual builds.

use serde::{Deserialize, Serialize};

use crate::host::{HookSlot, HostValue};

/// Kind of a hook slot.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// `useState`.
    State,
    /// `useReducer`.
    Reducer,
    /// `useEffect`.
    Effect,
    /// `useLayoutEffect`.
    LayoutEffect,
    /// `useInsertionEffect`.
    InsertionEffect,
    /// `useRef`.
    Ref,
    /// `useCallback`.
    Callback,
    /// `useMemo`.
    Memo,
    /// `useContext`.
    Context,
    /// `useId`.
    Id,
    /// `useTransition`.
    Transition,
    /// `useDeferredValue`.
    DeferredValue,
    /// `useSyncExternalStore`.
    SyncExternalStore,
    /// `useImperativeHandle`.
    ImperativeHandle,
    /// `useDebugValue`.
    DebugValue,
    /// Not recognised.
    Unknown,
}

impl HookKind {
    /// Decode a debug hook-type name (`useState` or `State`).
    pub fn from_debug_name(name: &str) -> Self {
        let bare = name.strip_prefix("use").unwrap_or(name);
        match bare {
            "State" => Self::State,
            "Reducer" => Self::Reducer,
            "Effect" => Self::Effect,
            "LayoutEffect" => Self::LayoutEffect,
            "InsertionEffect" => Self::InsertionEffect,
            "Ref" => Self::Ref,
            "Callback" => Self::Callback,
            "Memo" => Self::Memo,
            "Context" => Self::Context,
            "Id" => Self::Id,
            "Transition" => Self::Transition,
            "DeferredValue" => Self::DeferredValue,
            "SyncExternalStore" => Self::SyncExternalStore,
            "ImperativeHandle" => Self::ImperativeHandle,
            "DebugValue" => Self::DebugValue,
            _ => Self::Unknown,
        }
    }

    /// Display name shown next to the hook value.
    pub fn hook_name(self) -> &'static str {
        match self {
            Self::State => "State",
            Self::Reducer => "Reducer",
            Self::Effect => "Effect",
            Self::LayoutEffect => "LayoutEffect",
            Self::InsertionEffect => "InsertionEffect",
            Self::Ref => "Ref",
            Self::Callback => "Callback",
            Self::Memo => "Memo",
            Self::Context => "Context",
            Self::Id => "Id",
            Self::Transition => "Transition",
            Self::DeferredValue => "DeferredValue",
            Self::SyncExternalStore => "SyncExternalStore",
            Self::ImperativeHandle => "ImperativeHandle",
            Self::DebugValue => "DebugValue",
            Self::Unknown => "Unknown",
        }
    }
}

/// A named shape check for one hook kind.
#[derive(Clone, Copy)]
pub struct HookPredicate {
    /// Predicate name, reported with the classification.
    pub name: &'static str,
    /// Kind assigned on match.
    pub kind: HookKind,
    /// Shape check.
    pub matches: fn(&HookSlot) -> bool,
}

impl std::fmt::Debug for HookPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPredicate")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Predicates in evaluation order. First match wins.
pub const HOOK_PREDICATES: &[HookPredicate] = &[
    HookPredicate {
        name: "custom_reducer_queue",
        kind: HookKind::Reducer,
        matches: is_reducer,
    },
    HookPredicate {
        name: "dispatch_queue",
        kind: HookKind::State,
        matches: is_state,
    },
    HookPredicate {
        name: "insertion_effect_tag",
        kind: HookKind::InsertionEffect,
        matches: is_insertion_effect,
    },
    HookPredicate {
        name: "layout_effect_tag",
        kind: HookKind::LayoutEffect,
        matches: is_layout_effect,
    },
    HookPredicate {
        name: "effect_record",
        kind: HookKind::Effect,
        matches: is_effect,
    },
    HookPredicate {
        name: "ref_object",
        kind: HookKind::Ref,
        matches: is_ref,
    },
    HookPredicate {
        name: "callback_pair",
        kind: HookKind::Callback,
        matches: is_callback,
    },
    HookPredicate {
        name: "memo_pair",
        kind: HookKind::Memo,
        matches: is_memo,
    },
];

const HOOK_INSERTION: u32 = 2;
const HOOK_LAYOUT: u32 = 4;

/// First predicate matching `slot`.
pub fn classify(slot: &HookSlot) -> Option<&'static HookPredicate> {
    HOOK_PREDICATES.iter().find(|p| (p.matches)(slot))
}

fn queue_function(slot: &HookSlot, key: &str) -> Option<String> {
    match slot.queue.as_ref()?.get(key)? {
        HostValue::Function(name) => Some(name),
        _ => None,
    }
}

fn is_reducer(slot: &HookSlot) -> bool {
    queue_function(slot, "lastRenderedReducer").is_some_and(|name| name != "basicStateReducer")
}

fn is_state(slot: &HookSlot) -> bool {
    queue_function(slot, "dispatch").is_some()
}

fn effect_tag(slot: &HookSlot) -> Option<u32> {
    let state = &slot.memoized_state;
    if !matches!(state.get("create"), Some(HostValue::Function(_))) {
        return None;
    }
    match state.get("tag")? {
        HostValue::Number(tag) if tag >= 0.0 && tag.fract() == 0.0 => Some(tag as u32),
        _ => None,
    }
}

fn is_insertion_effect(slot: &HookSlot) -> bool {
    effect_tag(slot).is_some_and(|tag| tag & HOOK_INSERTION != 0)
}

fn is_layout_effect(slot: &HookSlot) -> bool {
    effect_tag(slot).is_some_and(|tag| tag & HOOK_LAYOUT != 0)
}

fn is_effect(slot: &HookSlot) -> bool {
    effect_tag(slot).is_some()
}

fn is_ref(slot: &HookSlot) -> bool {
    match &slot.memoized_state {
        HostValue::Object(object) => object.len() == 1 && object.contains_key("current"),
        _ => false,
    }
}

fn deps_pair(slot: &HookSlot) -> Option<HostValue> {
    let HostValue::Array(pair) = &slot.memoized_state else {
        return None;
    };
    if pair.len() != 2 {
        return None;
    }
    match pair.get(1)? {
        HostValue::Array(_) | HostValue::Null => pair.get(0),
        _ => None,
    }
}

fn is_callback(slot: &HookSlot) -> bool {
    matches!(deps_pair(slot), Some(HostValue::Function(_)))
}

fn is_memo(slot: &HookSlot) -> bool {
    deps_pair(slot).is_some()
}
