//! # A2A schema registry and validator
//!
//! Every payload that crosses an agent boundary is validated against a named
//! draft-07 JSON schema. The registry compiles each schema exactly once at
//! startup; validation is pure, non-panicking, and cheap enough for the hot
//! path (the cultural pipeline validates every streamed chunk).
//!
//! The built-in contracts:
//!
//! | Schema | Direction |
//! |--------|-----------|
//! | `StoryRequest` | orchestrator → story agent |
//! | `StoryChunk` | story agent output, per chunk |
//! | `ValidatedChunk` | cultural agent output |
//! | `RiddleRequest` | orchestrator → riddle agent |
//! | `RiddlePayload` | riddle agent output |
//! | `ImageRequest` | orchestrator → visual agent |
//! | `ImageResult` | visual agent output |
//!
//! Runtime registration via [`SchemaRegistry::register`] is supported for
//! operational tooling; writes are serialized behind the registry lock while
//! reads clone out an `Arc` and validate without holding it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use jsonschema::{Draft, JSONSchema};
use serde_json::{Value, json};

use crate::{Error, Result};

/// A compiled schema plus its raw definition (kept for introspection).
struct CompiledSchema {
    raw: Value,
    compiled: JSONSchema,
}

/// Registry of named, compiled draft-07 schemas.
pub struct SchemaRegistry {
    inner: RwLock<HashMap<String, Arc<CompiledSchema>>>,
}

impl SchemaRegistry {
    /// Build a registry containing the built-in A2A contracts.
    ///
    /// Panics only if a built-in schema is itself invalid, which is a
    /// compile-time bug, not a runtime condition.
    pub fn with_builtin() -> Self {
        let registry = Self {
            inner: RwLock::new(HashMap::new()),
        };
        for (name, schema) in builtin_schemas() {
            registry
                .register(name, schema)
                .expect("built-in schema must compile");
        }
        registry
    }

    /// Register (or replace) a schema at runtime.
    pub fn register(&self, name: &str, schema: Value) -> Result<()> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| Error::config(format!("schema '{}' does not compile: {}", name, e)))?;

        let entry = Arc::new(CompiledSchema {
            raw: schema,
            compiled,
        });
        self.inner
            .write()
            .expect("schema registry lock poisoned")
            .insert(name.to_string(), entry);
        Ok(())
    }

    /// Validate `data` against the named schema.
    ///
    /// Returns `(true, [])` on success, `(false, messages)` on violation or
    /// when the schema name is unknown. Never panics, never suspends.
    pub fn validate(&self, name: &str, data: &Value) -> (bool, Vec<String>) {
        let entry = {
            let guard = self.inner.read().expect("schema registry lock poisoned");
            guard.get(name).cloned()
        };

        let Some(entry) = entry else {
            return (false, vec![format!("Unknown schema: {}", name)]);
        };

        match entry.compiled.validate(data) {
            Ok(()) => (true, Vec::new()),
            Err(errors) => (false, errors.map(|e| e.to_string()).collect()),
        }
    }

    /// Validate and fail with [`Error::SchemaViolation`] on any violation.
    pub fn validate_or_reject(&self, name: &str, data: &Value) -> Result<()> {
        let (ok, errors) = self.validate(name, data);
        if ok {
            Ok(())
        } else {
            Err(Error::schema_violation(name, errors))
        }
    }

    /// Names of all registered schemas, sorted for stable output.
    pub fn list_schemas(&self) -> Vec<String> {
        let guard = self.inner.read().expect("schema registry lock poisoned");
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        names
    }

    /// The raw definition of a schema, if registered.
    pub fn raw_schema(&self, name: &str) -> Option<Value> {
        let guard = self.inner.read().expect("schema registry lock poisoned");
        guard.get(name).map(|entry| entry.raw.clone())
    }
}

/// Process-wide registry, initialized on first use.
pub fn registry() -> &'static SchemaRegistry {
    static REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();
    REGISTRY.get_or_init(SchemaRegistry::with_builtin)
}

/// The built-in schema definitions.
///
/// Request schemas allow the internal `_correction` property: the dispatcher
/// writes corrective instructions into the input payload between retry
/// attempts, and the augmented payload must remain a valid instance.
fn builtin_schemas() -> Vec<(&'static str, Value)> {
    vec![
        (
            "StoryRequest",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "StoryRequest",
                "type": "object",
                "required": ["culture", "theme"],
                "properties": {
                    "culture": { "type": "string" },
                    "theme": {
                        "type": "string",
                        "enum": [
                            "trickster", "creation", "wisdom", "courage",
                            "love", "origin", "moral"
                        ]
                    },
                    "complexity": {
                        "type": "string",
                        "enum": ["child", "teen", "adult"],
                        "default": "adult"
                    },
                    "continuation": { "type": "boolean", "default": false },
                    "session_context": { "type": "string" },
                    "_correction": { "type": "string" }
                },
                "additionalProperties": false
            }),
        ),
        (
            "StoryChunk",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "StoryChunk",
                "type": "object",
                "required": ["text", "culture"],
                "properties": {
                    "text": { "type": "string", "minLength": 1 },
                    "culture": { "type": "string" },
                    "cultural_claims": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["claim", "category"],
                            "properties": {
                                "claim": { "type": "string" },
                                "category": {
                                    "type": "string",
                                    "enum": [
                                        "proverb", "custom", "character",
                                        "location", "language", "historical"
                                    ]
                                }
                            }
                        }
                    },
                    "scene_description": { "type": "string" },
                    "is_final": { "type": "boolean", "default": false }
                },
                "additionalProperties": false
            }),
        ),
        (
            "ValidatedChunk",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "ValidatedChunk",
                "type": "object",
                "required": ["text", "confidence"],
                "properties": {
                    "text": { "type": "string" },
                    "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                    "corrections": { "type": "array", "items": { "type": "string" } },
                    "rejected_claims": { "type": "array", "items": { "type": "string" } },
                    "is_final": { "type": "boolean", "default": false }
                },
                "additionalProperties": false
            }),
        ),
        (
            "RiddleRequest",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "RiddleRequest",
                "type": "object",
                "required": ["culture"],
                "properties": {
                    "culture": { "type": "string" },
                    "difficulty": {
                        "type": "string",
                        "enum": ["easy", "medium", "hard"],
                        "default": "medium"
                    },
                    "session_context": { "type": "string" },
                    "_correction": { "type": "string" }
                },
                "additionalProperties": false
            }),
        ),
        (
            "RiddlePayload",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "RiddlePayload",
                "type": "object",
                "required": ["opening", "riddle_text", "answer", "culture"],
                "properties": {
                    "opening": { "type": "string" },
                    "riddle_text": { "type": "string" },
                    "answer": { "type": "string" },
                    "hints": {
                        "type": "array",
                        "items": { "type": "string" },
                        "minItems": 3,
                        "maxItems": 3
                    },
                    "explanation": { "type": "string" },
                    "culture": { "type": "string" },
                    "is_traditional": { "type": "boolean" }
                },
                "additionalProperties": false
            }),
        ),
        (
            "ImageRequest",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "ImageRequest",
                "type": "object",
                "required": ["scene_description", "culture"],
                "properties": {
                    "scene_description": { "type": "string", "minLength": 10 },
                    "culture": { "type": "string" },
                    "aspect_ratio": {
                        "type": "string",
                        "enum": ["16:9", "1:1", "9:16"],
                        "default": "16:9"
                    },
                    "_correction": { "type": "string" }
                },
                "additionalProperties": false
            }),
        ),
        (
            "ImageResult",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "ImageResult",
                "type": "object",
                "required": ["status"],
                "properties": {
                    "status": {
                        "type": "string",
                        "enum": ["success", "failed", "skipped"]
                    },
                    "url": { "type": "string" },
                    "error": { "type": "string" }
                },
                "additionalProperties": false
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schemas_registered() {
        let reg = SchemaRegistry::with_builtin();
        let names = reg.list_schemas();
        for expected in [
            "ImageRequest",
            "ImageResult",
            "RiddlePayload",
            "RiddleRequest",
            "StoryChunk",
            "StoryRequest",
            "ValidatedChunk",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_story_request_valid() {
        let reg = SchemaRegistry::with_builtin();
        let data = json!({"culture": "yoruba", "theme": "trickster"});
        let (ok, errors) = reg.validate("StoryRequest", &data);
        assert!(ok, "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_story_request_rejects_bad_theme() {
        let reg = SchemaRegistry::with_builtin();
        let data = json!({"culture": "yoruba", "theme": "spaceships"});
        let (ok, errors) = reg.validate("StoryRequest", &data);
        assert!(!ok);
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_story_request_rejects_extra_property() {
        let reg = SchemaRegistry::with_builtin();
        let data = json!({"culture": "zulu", "theme": "wisdom", "mood": "dark"});
        let (ok, _) = reg.validate("StoryRequest", &data);
        assert!(!ok);
    }

    #[test]
    fn test_story_request_allows_correction_field() {
        let reg = SchemaRegistry::with_builtin();
        let data = json!({
            "culture": "zulu",
            "theme": "wisdom",
            "_correction": "previous output missed required fields"
        });
        let (ok, errors) = reg.validate("StoryRequest", &data);
        assert!(ok, "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_story_chunk_requires_nonempty_text() {
        let reg = SchemaRegistry::with_builtin();
        let (ok, _) = reg.validate("StoryChunk", &json!({"text": "", "culture": "zulu"}));
        assert!(!ok);
        let (ok, _) = reg.validate("StoryChunk", &json!({"text": "Kwesukesukela...", "culture": "zulu"}));
        assert!(ok);
    }

    #[test]
    fn test_validated_chunk_confidence_bounds() {
        let reg = SchemaRegistry::with_builtin();
        let (ok, _) = reg.validate("ValidatedChunk", &json!({"text": "x", "confidence": 1.2}));
        assert!(!ok);
        let (ok, _) = reg.validate("ValidatedChunk", &json!({"text": "x", "confidence": 0.5}));
        assert!(ok);
    }

    #[test]
    fn test_riddle_payload_exactly_three_hints() {
        let reg = SchemaRegistry::with_builtin();
        let base = json!({
            "opening": "Kitendawili!",
            "riddle_text": "My house has no door.",
            "answer": "An egg",
            "culture": "swahili"
        });

        // No hints at all is acceptable (field is optional).
        let (ok, _) = reg.validate("RiddlePayload", &base);
        assert!(ok);

        let mut with_two = base.clone();
        with_two["hints"] = json!(["a", "b"]);
        let (ok, _) = reg.validate("RiddlePayload", &with_two);
        assert!(!ok);

        let mut with_three = base.clone();
        with_three["hints"] = json!(["a", "b", "c"]);
        let (ok, _) = reg.validate("RiddlePayload", &with_three);
        assert!(ok);

        let mut with_four = base;
        with_four["hints"] = json!(["a", "b", "c", "d"]);
        let (ok, _) = reg.validate("RiddlePayload", &with_four);
        assert!(!ok);
    }

    #[test]
    fn test_image_request_min_length() {
        let reg = SchemaRegistry::with_builtin();
        let (ok, _) = reg.validate(
            "ImageRequest",
            &json!({"scene_description": "short", "culture": "ashanti"}),
        );
        assert!(!ok);
        let (ok, _) = reg.validate(
            "ImageRequest",
            &json!({"scene_description": "a spider weaving a great web", "culture": "ashanti"}),
        );
        assert!(ok);
    }

    #[test]
    fn test_image_result_status_enum() {
        let reg = SchemaRegistry::with_builtin();
        let (ok, _) = reg.validate("ImageResult", &json!({"status": "pending"}));
        assert!(!ok);
        let (ok, _) = reg.validate("ImageResult", &json!({"status": "skipped"}));
        assert!(ok);
    }

    #[test]
    fn test_unknown_schema() {
        let reg = SchemaRegistry::with_builtin();
        let (ok, errors) = reg.validate("NoSuchSchema", &json!({}));
        assert!(!ok);
        assert_eq!(errors, vec!["Unknown schema: NoSuchSchema".to_string()]);
    }

    #[test]
    fn test_validate_or_reject_carries_schema_name() {
        let reg = SchemaRegistry::with_builtin();
        let err = reg
            .validate_or_reject("RiddleRequest", &json!({}))
            .unwrap_err();
        match err {
            Error::SchemaViolation { schema, errors } => {
                assert_eq!(schema, "RiddleRequest");
                assert!(!errors.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_runtime_register() {
        let reg = SchemaRegistry::with_builtin();
        reg.register(
            "Greeting",
            json!({"type": "object", "required": ["text"], "properties": {"text": {"type": "string"}}}),
        )
        .unwrap();
        let (ok, _) = reg.validate("Greeting", &json!({"text": "jambo"}));
        assert!(ok);
        assert!(reg.raw_schema("Greeting").is_some());
    }

    #[test]
    fn test_register_invalid_schema_fails() {
        let reg = SchemaRegistry::with_builtin();
        let result = reg.register("Broken", json!({"type": "not-a-type"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_is_deterministic() {
        let reg = SchemaRegistry::with_builtin();
        let data = json!({"culture": "kikuyu", "theme": "origin"});
        let first = reg.validate("StoryRequest", &data);
        let second = reg.validate("StoryRequest", &data);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }
}
