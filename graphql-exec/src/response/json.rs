//! Streaming UTF-8 JSON writer for operation results.
//!
//! The writer owns the response formatting rules: stable property order
//! (selection order for data, fixed order for payload envelopes), errors
//! sorted by path, locations sorted ascending, optional null omission, and a
//! strict nesting-depth limit.

use std::io::Write as _;

use serde::Deserialize;

use crate::error::ExecError;
use crate::response::Error;
use crate::response::IncrementalResult;
use crate::response::JsonValue;
use crate::response::OperationResult;
use crate::response::Path;
use crate::response::PathSegment;

pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Which `null` values are omitted from the serialized response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NullOmission {
    #[default]
    None,
    Fields,
    Lists,
    FieldsAndLists,
}

impl NullOmission {
    fn omits_fields(self) -> bool {
        matches!(self, NullOmission::Fields | NullOmission::FieldsAndLists)
    }

    fn omits_list_elements(self) -> bool {
        matches!(self, NullOmission::Lists | NullOmission::FieldsAndLists)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JsonWriterOptions {
    pub omission: NullOmission,
    pub indented: bool,
    pub max_depth: usize,
}

impl Default for JsonWriterOptions {
    fn default() -> Self {
        JsonWriterOptions {
            omission: NullOmission::None,
            indented: false,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Depth-first JSON writer over a byte buffer.
pub struct JsonWriter {
    buf: Vec<u8>,
    options: JsonWriterOptions,
    // One entry per open object/array; `true` once the first member was
    // written, to drive comma placement.
    scopes: Vec<bool>,
}

impl JsonWriter {
    pub fn new(options: JsonWriterOptions) -> Self {
        JsonWriter {
            buf: Vec::new(),
            options,
            scopes: Vec::new(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Serializes one response payload.
    pub fn write_result(&mut self, result: &OperationResult) -> Result<(), ExecError> {
        self.begin_object()?;
        if let Some(data) = &result.data {
            self.property("data")?;
            self.write_value(data)?;
        }
        if !result.errors.is_empty() {
            self.property("errors")?;
            self.begin_array()?;
            for error in result.sorted_errors() {
                self.element()?;
                self.write_error(error)?;
            }
            self.end_array();
        }
        if let Some(extensions) = &result.extensions {
            if !extensions.is_empty() {
                self.property("extensions")?;
                self.write_value(&JsonValue::Object(extensions.clone()))?;
            }
        }
        if !result.pending.is_empty() {
            self.property("pending")?;
            self.begin_array()?;
            for pending in &result.pending {
                self.element()?;
                self.begin_object()?;
                self.property("id")?;
                self.write_raw(pending.id.to_string().as_bytes());
                self.property("path")?;
                self.write_path(&pending.path)?;
                if let Some(label) = &pending.label {
                    self.property("label")?;
                    self.write_string(label);
                }
                self.end_object();
            }
            self.end_array();
        }
        if !result.incremental.is_empty() {
            self.property("incremental")?;
            self.begin_array()?;
            for incremental in &result.incremental {
                self.element()?;
                self.write_incremental(incremental)?;
            }
            self.end_array();
        }
        if !result.completed.is_empty() {
            self.property("completed")?;
            self.begin_array()?;
            for completed in &result.completed {
                self.element()?;
                self.begin_object()?;
                self.property("id")?;
                self.write_raw(completed.id.to_string().as_bytes());
                self.write_errors_property(&completed.errors)?;
                self.end_object();
            }
            self.end_array();
        }
        if let Some(has_next) = result.has_next {
            self.property("hasNext")?;
            self.write_raw(if has_next { b"true" } else { b"false" });
        }
        self.end_object();
        Ok(())
    }

    /// Writes an arbitrary JSON value, honouring the null-omission mode.
    pub fn write_value(&mut self, value: &JsonValue) -> Result<(), ExecError> {
        match value {
            JsonValue::Null => self.write_raw(b"null"),
            JsonValue::Bool(true) => self.write_raw(b"true"),
            JsonValue::Bool(false) => self.write_raw(b"false"),
            JsonValue::Number(number) => self.write_raw(number.to_string().as_bytes()),
            JsonValue::String(string) => self.write_string(string.as_str()),
            JsonValue::Array(items) => {
                self.begin_array()?;
                for item in items {
                    if item.is_null() && self.options.omission.omits_list_elements() {
                        continue;
                    }
                    self.element()?;
                    self.write_value(item)?;
                }
                self.end_array();
            }
            JsonValue::Object(map) => {
                self.begin_object()?;
                for (key, item) in map.iter() {
                    // The property name is held back until the value is known
                    // to be written at all.
                    if item.is_null() && self.options.omission.omits_fields() {
                        continue;
                    }
                    self.property(key.as_str())?;
                    self.write_value(item)?;
                }
                self.end_object();
            }
        }
        Ok(())
    }

    /// Injects pre-formatted UTF-8 JSON where a value is expected. The caller
    /// is responsible for the bytes being a complete, valid JSON value.
    pub fn write_raw_value(&mut self, utf8: &[u8]) {
        self.write_raw(utf8);
    }

    fn write_error(&mut self, error: &Error) -> Result<(), ExecError> {
        self.begin_object()?;
        self.property("message")?;
        self.write_string(&error.message);
        if !error.locations.is_empty() {
            let mut locations = error.locations.clone();
            locations.sort();
            self.property("locations")?;
            self.begin_array()?;
            for location in locations {
                self.element()?;
                self.begin_object()?;
                self.property("line")?;
                self.write_raw(location.line.to_string().as_bytes());
                self.property("column")?;
                self.write_raw(location.column.to_string().as_bytes());
                self.end_object();
            }
            self.end_array();
        }
        if let Some(path) = &error.path {
            self.property("path")?;
            self.write_path(path)?;
        }
        if !error.extensions.is_empty() {
            self.property("extensions")?;
            self.write_value(&JsonValue::Object(error.extensions.clone()))?;
        }
        self.end_object();
        Ok(())
    }

    fn write_errors_property(&mut self, errors: &[Error]) -> Result<(), ExecError> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut sorted: Vec<&Error> = errors.iter().collect();
        sorted.sort_by(|a, b| a.compare_by_path(b));
        self.property("errors")?;
        self.begin_array()?;
        for error in sorted {
            self.element()?;
            self.write_error(error)?;
        }
        self.end_array();
        Ok(())
    }

    fn write_incremental(&mut self, incremental: &IncrementalResult) -> Result<(), ExecError> {
        match incremental {
            IncrementalResult::Object(result) => {
                self.begin_object()?;
                self.property("id")?;
                self.write_raw(result.id.to_string().as_bytes());
                if let Some(sub_path) = &result.sub_path {
                    self.property("subPath")?;
                    self.write_path(sub_path)?;
                }
                if let Some(data) = &result.data {
                    self.property("data")?;
                    self.write_value(data)?;
                }
                self.write_errors_property(&result.errors)?;
                self.end_object();
            }
            IncrementalResult::List(result) => {
                self.begin_object()?;
                self.property("id")?;
                self.write_raw(result.id.to_string().as_bytes());
                self.property("items")?;
                self.begin_array()?;
                for item in &result.items {
                    if item.is_null() && self.options.omission.omits_list_elements() {
                        continue;
                    }
                    self.element()?;
                    self.write_value(item)?;
                }
                self.end_array();
                self.write_errors_property(&result.errors)?;
                self.end_object();
            }
        }
        Ok(())
    }

    fn write_path(&mut self, path: &Path) -> Result<(), ExecError> {
        self.begin_array()?;
        for segment in &path.0 {
            self.element()?;
            match segment {
                PathSegment::Field(name) => self.write_string(name.as_str()),
                PathSegment::Index(index) => self.write_raw(index.to_string().as_bytes()),
            }
        }
        self.end_array();
        Ok(())
    }

    fn begin_object(&mut self) -> Result<(), ExecError> {
        self.enter()?;
        self.buf.push(b'{');
        Ok(())
    }

    fn end_object(&mut self) {
        let had_members = self.scopes.pop().unwrap_or(false);
        if had_members {
            self.newline_indent();
        }
        self.buf.push(b'}');
    }

    fn begin_array(&mut self) -> Result<(), ExecError> {
        self.enter()?;
        self.buf.push(b'[');
        Ok(())
    }

    fn end_array(&mut self) {
        let had_members = self.scopes.pop().unwrap_or(false);
        if had_members {
            self.newline_indent();
        }
        self.buf.push(b']');
    }

    fn enter(&mut self) -> Result<(), ExecError> {
        if self.scopes.len() >= self.options.max_depth {
            return Err(ExecError::DepthLimitExceeded {
                limit: self.options.max_depth,
            });
        }
        self.scopes.push(false);
        Ok(())
    }

    /// Starts an object property: separator, indentation, and the quoted name.
    fn property(&mut self, name: &str) -> Result<(), ExecError> {
        self.element()?;
        self.write_string(name);
        if self.options.indented {
            self.buf.extend_from_slice(b": ");
        } else {
            self.buf.push(b':');
        }
        Ok(())
    }

    /// Starts an object member or array element: comma and indentation.
    fn element(&mut self) -> Result<(), ExecError> {
        let Some(first_written) = self.scopes.last_mut() else {
            return Ok(());
        };
        if *first_written {
            self.buf.push(b',');
        }
        *first_written = true;
        self.newline_indent();
        Ok(())
    }

    fn newline_indent(&mut self) {
        if self.options.indented {
            self.buf.push(b'\n');
            for _ in 0..self.scopes.len() {
                self.buf.extend_from_slice(b"  ");
            }
        }
    }

    fn write_string(&mut self, value: &str) {
        // serde_json performs the escaping; writing a string to a Vec cannot
        // fail.
        let _ = serde_json::to_writer(&mut self.buf, value);
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        let _ = self.buf.write_all(bytes);
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::name;
    use serde_json_bytes::json;

    use super::*;
    use crate::response::Location;

    fn write(value: serde_json_bytes::Value, options: JsonWriterOptions) -> String {
        let mut writer = JsonWriter::new(options);
        writer.write_value(&value).unwrap();
        String::from_utf8(writer.into_bytes()).unwrap()
    }

    #[test]
    fn minified_output() {
        let out = write(
            json!({ "a": 1, "b": [true, null], "c": "x\"y" }),
            JsonWriterOptions::default(),
        );
        assert_eq!(out, r#"{"a":1,"b":[true,null],"c":"x\"y"}"#);
    }

    #[test]
    fn omits_null_fields() {
        let out = write(
            json!({ "a": null, "b": 2 }),
            JsonWriterOptions {
                omission: NullOmission::Fields,
                ..Default::default()
            },
        );
        assert_eq!(out, r#"{"b":2}"#);
    }

    #[test]
    fn omits_null_list_elements() {
        let out = write(
            json!({ "a": [1, null, 3], "b": null }),
            JsonWriterOptions {
                omission: NullOmission::Lists,
                ..Default::default()
            },
        );
        assert_eq!(out, r#"{"a":[1,3],"b":null}"#);
    }

    #[test]
    fn omits_both_when_configured() {
        let out = write(
            json!({ "a": [null], "b": null }),
            JsonWriterOptions {
                omission: NullOmission::FieldsAndLists,
                ..Default::default()
            },
        );
        assert_eq!(out, r#"{"a":[]}"#);
    }

    #[test]
    fn indented_output() {
        let out = write(
            json!({ "a": [1] }),
            JsonWriterOptions {
                indented: true,
                ..Default::default()
            },
        );
        insta::assert_snapshot!(out, @r###"
        {
          "a": [
            1
          ]
        }
        "###);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut value = json!(1);
        for _ in 0..70 {
            value = serde_json_bytes::Value::Array(vec![value]);
        }
        let mut writer = JsonWriter::new(JsonWriterOptions::default());
        let result = writer.write_value(&value);
        assert!(matches!(
            result,
            Err(ExecError::DepthLimitExceeded { limit: 64 })
        ));
    }

    #[test]
    fn errors_are_sorted_by_path_and_location() {
        let result = OperationResult {
            data: Some(json!({})),
            errors: vec![
                Error::new("late")
                    .with_path(crate::response::Path::empty().join_field(&name!("b")))
                    .with_location(Location { line: 3, column: 5 })
                    .with_location(Location { line: 1, column: 2 }),
                Error::new("first"),
                Error::new("early")
                    .with_path(crate::response::Path::empty().join_field(&name!("a"))),
            ],
            ..Default::default()
        };
        let bytes = result.to_json_bytes(&JsonWriterOptions::default()).unwrap();
        let out = String::from_utf8(bytes).unwrap();
        assert_eq!(
            out,
            "{\"data\":{},\"errors\":[\
             {\"message\":\"first\"},\
             {\"message\":\"early\",\"path\":[\"a\"]},\
             {\"message\":\"late\",\"locations\":[{\"line\":1,\"column\":2},{\"line\":3,\"column\":5}],\"path\":[\"b\"]}\
             ]}"
        );
    }

    #[test]
    fn raw_injection_is_passed_through() {
        let mut writer = JsonWriter::new(JsonWriterOptions::default());
        writer.write_raw_value(br#"{"precomputed":true}"#);
        assert_eq!(
            String::from_utf8(writer.into_bytes()).unwrap(),
            r#"{"precomputed":true}"#
        );
    }
}
