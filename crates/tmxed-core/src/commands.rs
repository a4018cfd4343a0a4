use std::sync::OnceLock;

use regex::Regex;

use crate::state::Payload;
use crate::state::StatusCode;

/// Which in-flight status a long-running command family reports while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFamily {
    Loading,
    Saving,
    Processing,
}

impl StatusFamily {
    pub fn in_flight(self) -> StatusCode {
        match self {
            Self::Loading => StatusCode::Loading,
            Self::Saving => StatusCode::Saving,
            Self::Processing => StatusCode::Processing,
        }
    }

    pub fn accepts(self, status: &StatusCode) -> bool {
        *status == self.in_flight()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub command: &'static str,
    pub family: StatusFamily,
    /// Poll field holding the number of units handled so far.
    pub progress_key: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Immediate,
    LongRunning(PollSpec),
}

/// How a successful command changes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEffect {
    None,
    Open,
    Save,
    Create,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub title: &'static str,
    pub kind: CommandKind,
    pub mutating: bool,
    pub requires_document: bool,
    pub session_effect: SessionEffect,
}

impl CommandSpec {
    pub fn poll(&self) -> Option<&PollSpec> {
        match &self.kind {
            CommandKind::Immediate => None,
            CommandKind::LongRunning(poll) => Some(poll),
        }
    }

    pub fn is_long_running(&self) -> bool {
        self.poll().is_some()
    }
}

const fn immediate(
    name: &'static str,
    title: &'static str,
    mutating: bool,
    requires_document: bool,
    session_effect: SessionEffect,
) -> CommandSpec {
    CommandSpec {
        name,
        title,
        kind: CommandKind::Immediate,
        mutating,
        requires_document,
        session_effect,
    }
}

const fn long_running(
    name: &'static str,
    title: &'static str,
    poll: PollSpec,
    mutating: bool,
    requires_document: bool,
    session_effect: SessionEffect,
) -> CommandSpec {
    CommandSpec {
        name,
        title,
        kind: CommandKind::LongRunning(poll),
        mutating,
        requires_document,
        session_effect,
    }
}

const LOADING: PollSpec = PollSpec {
    command: "loadingProgress",
    family: StatusFamily::Loading,
    progress_key: "Loaded",
};

const SAVING: PollSpec = PollSpec {
    command: "savingProgress",
    family: StatusFamily::Saving,
    progress_key: "Saved",
};

const EXPORTING: PollSpec = PollSpec {
    command: "exportProgress",
    family: StatusFamily::Processing,
    progress_key: "Exported",
};

const VALIDATING: PollSpec = PollSpec {
    command: "validatingProgress",
    family: StatusFamily::Processing,
    progress_key: "Validated",
};

const CLEANING: PollSpec = PollSpec {
    command: "cleaningProgress",
    family: StatusFamily::Processing,
    progress_key: "Cleaned",
};

const SPLITTING: PollSpec = PollSpec {
    command: "getSplitProgress",
    family: StatusFamily::Processing,
    progress_key: "Split",
};

const MERGING: PollSpec = PollSpec {
    command: "getMergeProgress",
    family: StatusFamily::Processing,
    progress_key: "Merged",
};

const PROCESSING: PollSpec = PollSpec {
    command: "processingProgress",
    family: StatusFamily::Processing,
    progress_key: "Processed",
};

const COMMAND_SPECS: [CommandSpec; 40] = [
    long_running("openFile", "Loading", LOADING, false, false, SessionEffect::Open),
    long_running("saveFile", "Saving", SAVING, false, true, SessionEffect::Save),
    long_running("exportDelimited", "Exporting", EXPORTING, false, true, SessionEffect::None),
    long_running("exportExcel", "Exporting", EXPORTING, false, true, SessionEffect::None),
    long_running("validateFile", "Validating", VALIDATING, false, false, SessionEffect::None),
    long_running("cleanCharacters", "Cleaning", CLEANING, false, false, SessionEffect::None),
    long_running("splitFile", "Splitting", SPLITTING, false, false, SessionEffect::None),
    long_running("mergeFiles", "Merging", MERGING, false, false, SessionEffect::None),
    long_running("replaceText", "Replacing text", PROCESSING, true, true, SessionEffect::None),
    long_running("removeTags", "Removing tags", PROCESSING, true, true, SessionEffect::None),
    long_running(
        "removeDuplicates",
        "Removing duplicates",
        PROCESSING,
        true,
        true,
        SessionEffect::None,
    ),
    long_running(
        "removeUntranslated",
        "Removing untranslated units",
        PROCESSING,
        true,
        true,
        SessionEffect::None,
    ),
    long_running(
        "removeSameAsSource",
        "Removing targets same as source",
        PROCESSING,
        true,
        true,
        SessionEffect::None,
    ),
    long_running("removeSpaces", "Removing spaces", PROCESSING, true, true, SessionEffect::None),
    long_running(
        "changeLanguage",
        "Changing language",
        PROCESSING,
        true,
        true,
        SessionEffect::None,
    ),
    long_running(
        "consolidateUnits",
        "Consolidating units",
        PROCESSING,
        true,
        true,
        SessionEffect::None,
    ),
    long_running("processTasks", "Processing tasks", PROCESSING, true, true, SessionEffect::None),
    immediate("getSegments", "Segments", false, true, SessionEffect::None),
    immediate("getLanguages", "Languages", false, true, SessionEffect::None),
    immediate("getTuData", "Unit data", false, true, SessionEffect::None),
    immediate("getTuvData", "Variant data", false, true, SessionEffect::None),
    immediate("setAttributes", "Attributes", true, true, SessionEffect::None),
    immediate("setProperties", "Properties", true, true, SessionEffect::None),
    immediate("setNotes", "Notes", true, true, SessionEffect::None),
    immediate("insertUnit", "Insert unit", true, true, SessionEffect::None),
    immediate("deleteUnits", "Delete units", true, true, SessionEffect::None),
    immediate("addLanguage", "Add language", true, true, SessionEffect::None),
    immediate("removeLanguage", "Remove language", true, true, SessionEffect::None),
    immediate("getAllLanguages", "All languages", false, false, SessionEffect::None),
    immediate("getSrcLanguage", "Source language", false, true, SessionEffect::None),
    immediate("setSrcLanguage", "Set source language", true, true, SessionEffect::None),
    immediate("systemInfo", "System information", false, false, SessionEffect::None),
    immediate("getCharsets", "Character sets", false, false, SessionEffect::None),
    immediate("stop", "Stop engine", false, false, SessionEffect::None),
    immediate("createFile", "New document", false, false, SessionEffect::Create),
    immediate("closeFile", "Close", false, true, SessionEffect::Close),
    immediate("saveTuvData", "Edit segment", true, true, SessionEffect::None),
    immediate("getFileProperties", "File properties", false, true, SessionEffect::None),
    immediate("getCount", "Unit count", false, true, SessionEffect::None),
    immediate("sortUnits", "Sort units", false, true, SessionEffect::None),
];

pub const OPEN_FILE: &str = "openFile";
pub const SAVE_FILE: &str = "saveFile";
pub const CREATE_FILE: &str = "createFile";
pub const CLOSE_FILE: &str = "closeFile";
pub const STOP: &str = "stop";
pub const SYSTEM_INFO: &str = "systemInfo";

pub struct CommandRegistry;

impl CommandRegistry {
    pub fn list() -> &'static [CommandSpec] {
        &COMMAND_SPECS
    }

    pub fn get(name: &str) -> Option<&'static CommandSpec> {
        COMMAND_SPECS.iter().find(|spec| spec.name == name)
    }

    /// Lookup for names the controller issues itself.
    pub(crate) fn builtin(name: &str) -> &'static CommandSpec {
        match Self::get(name) {
            Some(spec) => spec,
            None => unreachable!("{name} is registered in COMMAND_SPECS"),
        }
    }
}

fn language_tag_re() -> &'static Regex {
    static LANGUAGE_TAG: OnceLock<Regex> = OnceLock::new();
    LANGUAGE_TAG.get_or_init(|| {
        Regex::new(r"^[A-Za-z]{2,3}(-[A-Za-z0-9]{1,8})*$").unwrap_or_else(|err| {
            unreachable!("language tag pattern is valid: {err}")
        })
    })
}

pub fn is_language_tag(value: &str) -> bool {
    language_tag_re().is_match(value)
}

fn str_arg<'a>(payload: &'a Payload, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(serde_json::Value::as_str)
}

fn require_language(payload: &Payload, key: &str) -> Result<(), String> {
    match str_arg(payload, key) {
        Some(value) if is_language_tag(value) => Ok(()),
        Some(value) => Err(format!("'{value}' is not a valid language code")),
        None => Err(format!("missing language argument '{key}'")),
    }
}

fn require_path(payload: &Payload, key: &str) -> Result<(), String> {
    match str_arg(payload, key) {
        Some(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(format!("missing file argument '{key}'")),
    }
}

/// Client-side checks that never need the engine. A failure is reported as a
/// local rejection and the command is not sent.
pub fn validate_arguments(spec: &CommandSpec, payload: &Payload) -> Result<(), String> {
    match spec.name {
        "openFile" | "validateFile" | "cleanCharacters" => require_path(payload, "file"),
        "saveFile" => match payload.get("file") {
            Some(_) => require_path(payload, "file"),
            None => Ok(()),
        },
        "exportDelimited" | "exportExcel" => require_path(payload, "output"),
        "changeLanguage" => {
            require_language(payload, "oldLanguage")?;
            require_language(payload, "newLanguage")?;
            let old = str_arg(payload, "oldLanguage").unwrap_or_default();
            let new = str_arg(payload, "newLanguage").unwrap_or_default();
            if old.eq_ignore_ascii_case(new) {
                return Err("source and target languages are identical".to_string());
            }
            Ok(())
        }
        "addLanguage" | "removeLanguage" | "setSrcLanguage" => require_language(payload, "lang"),
        "splitFile" => {
            require_path(payload, "file")?;
            match payload.get("parts").and_then(serde_json::Value::as_u64) {
                Some(parts) if parts >= 2 => Ok(()),
                _ => Err("a file must be split into at least 2 parts".to_string()),
            }
        }
        "mergeFiles" => {
            require_path(payload, "merged")?;
            let files = payload
                .get("files")
                .and_then(serde_json::Value::as_array)
                .map_or(0, Vec::len);
            if files < 2 {
                return Err("at least 2 files are needed for merging".to_string());
            }
            Ok(())
        }
        "replaceText" => match str_arg(payload, "search") {
            Some(search) if !search.is_empty() => Ok(()),
            _ => Err("search text is empty".to_string()),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<&str> = CommandRegistry::list().iter().map(|spec| spec.name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn long_running_families_match_poll_commands() {
        let polls: Vec<(&str, &str, StatusFamily)> = [
            "openFile",
            "saveFile",
            "exportExcel",
            "validateFile",
            "splitFile",
            "mergeFiles",
            "consolidateUnits",
        ]
        .iter()
        .map(|name| {
            let poll = CommandRegistry::get(name)
                .and_then(CommandSpec::poll)
                .expect("long-running command");
            (*name, poll.command, poll.family)
        })
        .collect();
        assert_eq!(
            polls,
            vec![
                ("openFile", "loadingProgress", StatusFamily::Loading),
                ("saveFile", "savingProgress", StatusFamily::Saving),
                ("exportExcel", "exportProgress", StatusFamily::Processing),
                ("validateFile", "validatingProgress", StatusFamily::Processing),
                ("splitFile", "getSplitProgress", StatusFamily::Processing),
                ("mergeFiles", "getMergeProgress", StatusFamily::Processing),
                ("consolidateUnits", "processingProgress", StatusFamily::Processing),
            ]
        );
    }

    #[test]
    fn queries_are_immediate_and_never_mutating() {
        for name in ["getSegments", "getLanguages", "getTuvData", "systemInfo", "getCharsets"] {
            let spec = CommandRegistry::get(name).expect("registered");
            assert!(!spec.is_long_running(), "{name} should be immediate");
            assert!(!spec.mutating, "{name} should not mark the document dirty");
        }
    }

    #[test]
    fn unknown_name_is_not_registered() {
        assert!(CommandRegistry::get("formatDisk").is_none());
    }

    #[test]
    fn identical_languages_are_rejected() {
        let spec = CommandRegistry::get("changeLanguage").expect("registered");
        let err = validate_arguments(
            spec,
            &payload(json!({"oldLanguage": "en-US", "newLanguage": "EN-us"})),
        )
        .expect_err("identical languages");
        assert_eq!(err, "source and target languages are identical");

        assert!(validate_arguments(
            spec,
            &payload(json!({"oldLanguage": "en-US", "newLanguage": "en-GB"}))
        )
        .is_ok());
    }

    #[test]
    fn language_tags_are_checked() {
        assert!(is_language_tag("pt-BR"));
        assert!(is_language_tag("zh-Hant-TW"));
        assert!(!is_language_tag("english"));
        assert!(!is_language_tag("e"));
        assert!(!is_language_tag("en_US"));
    }

    #[test]
    fn split_and_merge_need_enough_parts() {
        let split = CommandRegistry::get("splitFile").expect("registered");
        assert!(validate_arguments(split, &payload(json!({"file": "a.tmx", "parts": 1}))).is_err());
        assert!(validate_arguments(split, &payload(json!({"file": "a.tmx", "parts": 3}))).is_ok());

        let merge = CommandRegistry::get("mergeFiles").expect("registered");
        assert!(validate_arguments(
            merge,
            &payload(json!({"merged": "out.tmx", "files": ["a.tmx"]}))
        )
        .is_err());
        assert!(validate_arguments(
            merge,
            &payload(json!({"merged": "out.tmx", "files": ["a.tmx", "b.tmx"]}))
        )
        .is_ok());
    }

    #[test]
    fn save_without_path_is_allowed() {
        let save = CommandRegistry::get("saveFile").expect("registered");
        assert!(validate_arguments(save, &Payload::new()).is_ok());
        assert!(validate_arguments(save, &payload(json!({"file": " "}))).is_err());
    }
}
