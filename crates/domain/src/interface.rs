//! 输入/输出接口与数据
//!
//! `Interface` 描述一组命名参数（文件或 JSON），`Data` 是满足接口的一组取值。
//! 两者的 JSON 形态在解码时补齐缺省字段。

use std::collections::BTreeMap;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

pub const INTERFACE_SCHEMA_VERSION: &str = "6";
pub const DATA_SCHEMA_VERSION: &str = "7";

const VALID_JSON_TYPES: [&str; 6] = ["array", "boolean", "integer", "number", "object", "string"];

/// 校验警告，不阻止操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub name: String,
    pub description: String,
}

impl ValidationWarning {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterKind {
    File {
        multiple: bool,
        media_types: Vec<String>,
    },
    Json {
        json_type: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub required: bool,
    pub kind: ParameterKind,
}

impl Parameter {
    pub fn file(name: impl Into<String>, required: bool, multiple: bool) -> Self {
        Self {
            name: name.into(),
            required,
            kind: ParameterKind::File {
                multiple,
                media_types: Vec::new(),
            },
        }
    }

    pub fn json(name: impl Into<String>, json_type: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            required,
            kind: ParameterKind::Json {
                json_type: json_type.into(),
            },
        }
    }

    pub fn param_type(&self) -> &'static str {
        match self.kind {
            ParameterKind::File { .. } => "file",
            ParameterKind::Json { .. } => "json",
        }
    }

    /// 校验 `connecting` 参数能否接入本参数
    pub fn validate_connection(
        &self,
        connecting: &Parameter,
    ) -> OrchestratorResult<Vec<ValidationWarning>> {
        if self.param_type() != connecting.param_type() {
            return Err(OrchestratorError::InvalidRecipeConnection(format!(
                "Parameter '{}' of type '{}' cannot accept type '{}'",
                self.name,
                self.param_type(),
                connecting.param_type()
            )));
        }

        if self.required && !connecting.required {
            return Err(OrchestratorError::InvalidRecipeConnection(format!(
                "Parameter '{}' is required and cannot accept an optional value",
                self.name
            )));
        }

        let mut warnings = Vec::new();
        match (&self.kind, &connecting.kind) {
            (
                ParameterKind::File {
                    multiple,
                    media_types,
                },
                ParameterKind::File {
                    multiple: connecting_multiple,
                    media_types: connecting_media_types,
                },
            ) => {
                if !multiple && *connecting_multiple {
                    return Err(OrchestratorError::InvalidRecipeConnection(format!(
                        "Parameter '{}' cannot accept multiple files",
                        self.name
                    )));
                }
                let mismatched: Vec<&str> = connecting_media_types
                    .iter()
                    .filter(|m| !media_types.is_empty() && !media_types.contains(m))
                    .map(String::as_str)
                    .collect();
                if !mismatched.is_empty() {
                    warnings.push(ValidationWarning::new(
                        "MISMATCHED_MEDIA_TYPES",
                        format!(
                            "Parameter '{}' might not accept [{}]",
                            self.name,
                            mismatched.join(", ")
                        ),
                    ));
                }
            }
            (
                ParameterKind::Json { json_type },
                ParameterKind::Json {
                    json_type: connecting_type,
                },
            ) => {
                if json_type != connecting_type {
                    return Err(OrchestratorError::InvalidRecipeConnection(format!(
                        "Parameter '{}' of JSON type '{}' cannot accept JSON type '{}'",
                        self.name, json_type, connecting_type
                    )));
                }
            }
            _ => {}
        }
        Ok(warnings)
    }
}

/// 一组命名参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "InterfaceJson", into = "InterfaceJson")]
pub struct Interface {
    pub parameters: BTreeMap<String, Parameter>,
}

impl Interface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, parameter: Parameter) -> OrchestratorResult<()> {
        if self.parameters.contains_key(&parameter.name) {
            return Err(OrchestratorError::invalid_definition(
                "DUPLICATE_INPUT",
                format!("Duplicate parameter '{}'", parameter.name),
            ));
        }
        self.parameters.insert(parameter.name.clone(), parameter);
        Ok(())
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.insert(parameter.name.clone(), parameter);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn validate(&self) -> OrchestratorResult<Vec<ValidationWarning>> {
        for parameter in self.parameters.values() {
            if let ParameterKind::Json { json_type } = &parameter.kind {
                if !VALID_JSON_TYPES.contains(&json_type.as_str()) {
                    return Err(OrchestratorError::invalid_definition(
                        "INVALID_JSON_TYPE",
                        format!(
                            "Parameter '{}' has invalid JSON type '{}'",
                            parameter.name, json_type
                        ),
                    ));
                }
            }
        }
        Ok(Vec::new())
    }

    /// 校验 `connecting` 接口能否作为本接口的输入
    ///
    /// 本接口的每个必填参数都必须由 `connecting` 提供且类型兼容。
    pub fn validate_connection(
        &self,
        connecting: &Interface,
    ) -> OrchestratorResult<Vec<ValidationWarning>> {
        let mut warnings = Vec::new();
        for (name, parameter) in &self.parameters {
            match connecting.parameters.get(name) {
                Some(connecting_parameter) => {
                    warnings.extend(parameter.validate_connection(connecting_parameter)?);
                }
                None if parameter.required => {
                    return Err(OrchestratorError::InvalidRecipeConnection(format!(
                        "Parameter '{name}' is required"
                    )));
                }
                None => {}
            }
        }
        for name in connecting.parameters.keys() {
            if !self.parameters.contains_key(name) {
                warnings.push(ValidationWarning::new(
                    "UNKNOWN_PARAM",
                    format!("Parameter '{name}' is not used"),
                ));
            }
        }
        Ok(warnings)
    }

    /// 把 `output_interface` 中名为 `output_name` 的参数以 `input_name` 加入本接口
    pub fn add_parameter_from_output_interface(
        &mut self,
        input_name: &str,
        output_name: &str,
        output_interface: &Interface,
    ) -> OrchestratorResult<()> {
        let output = output_interface.parameters.get(output_name).ok_or_else(|| {
            OrchestratorError::InvalidRecipeConnection(format!(
                "Output parameter '{output_name}' is not defined"
            ))
        })?;
        let mut parameter = output.clone();
        parameter.name = input_name.to_string();
        self.add_parameter(parameter)
            .map_err(|_| OrchestratorError::InvalidRecipeConnection(format!(
                "Input '{input_name}' has more than one parameter connected to it"
            )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileParameterJson {
    name: String,
    #[serde(default = "default_true")]
    required: bool,
    #[serde(default)]
    multiple: bool,
    #[serde(default)]
    media_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonParameterJson {
    name: String,
    #[serde(rename = "type")]
    json_type: String,
    #[serde(default = "default_true")]
    required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InterfaceJson {
    #[serde(default = "interface_version")]
    version: String,
    #[serde(default)]
    files: Vec<FileParameterJson>,
    #[serde(default)]
    json: Vec<JsonParameterJson>,
}

fn default_true() -> bool {
    true
}

fn interface_version() -> String {
    INTERFACE_SCHEMA_VERSION.to_string()
}

impl From<InterfaceJson> for Interface {
    fn from(value: InterfaceJson) -> Self {
        let mut interface = Interface::new();
        for file in value.files {
            interface.parameters.insert(
                file.name.clone(),
                Parameter {
                    name: file.name,
                    required: file.required,
                    kind: ParameterKind::File {
                        multiple: file.multiple,
                        media_types: file.media_types,
                    },
                },
            );
        }
        for json in value.json {
            interface.parameters.insert(
                json.name.clone(),
                Parameter {
                    name: json.name,
                    required: json.required,
                    kind: ParameterKind::Json {
                        json_type: json.json_type,
                    },
                },
            );
        }
        interface
    }
}

impl From<Interface> for InterfaceJson {
    fn from(value: Interface) -> Self {
        let mut files = Vec::new();
        let mut json = Vec::new();
        for parameter in value.parameters.into_values() {
            match parameter.kind {
                ParameterKind::File {
                    multiple,
                    media_types,
                } => files.push(FileParameterJson {
                    name: parameter.name,
                    required: parameter.required,
                    multiple,
                    media_types,
                }),
                ParameterKind::Json { json_type } => json.push(JsonParameterJson {
                    name: parameter.name,
                    json_type,
                    required: parameter.required,
                }),
            }
        }
        InterfaceJson {
            version: interface_version(),
            files,
            json,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    File(Vec<i64>),
    Json(serde_json::Value),
}

/// 满足某个接口的一组取值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "DataJson", into = "DataJson")]
pub struct Data {
    pub values: BTreeMap<String, DataValue>,
}

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(mut self, name: impl Into<String>, file_ids: Vec<i64>) -> Self {
        self.values.insert(name.into(), DataValue::File(file_ids));
        self
    }

    pub fn with_json(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(name.into(), DataValue::Json(value));
        self
    }

    pub fn add_value(&mut self, name: impl Into<String>, value: DataValue) -> OrchestratorResult<()> {
        let name = name.into();
        if self.values.contains_key(&name) {
            return Err(OrchestratorError::invalid_data(
                "DUPLICATE_VALUE",
                format!("Duplicate value '{name}'"),
            ));
        }
        self.values.insert(name, value);
        Ok(())
    }

    /// 把 `output_data` 中名为 `output_name` 的值以 `input_name` 加入本数据
    pub fn add_value_from_output_data(
        &mut self,
        input_name: &str,
        output_name: &str,
        output_data: &Data,
    ) -> OrchestratorResult<()> {
        let value = output_data.values.get(output_name).ok_or_else(|| {
            OrchestratorError::invalid_data(
                "MISSING_VALUE",
                format!("Output '{output_name}' has no value"),
            )
        })?;
        self.add_value(input_name, value.clone())
    }

    /// 所有文件 ID（去重排序）
    pub fn file_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .values
            .values()
            .filter_map(|value| match value {
                DataValue::File(ids) => Some(ids.iter().copied()),
                DataValue::Json(_) => None,
            })
            .flatten()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// 校验本数据满足 `interface`
    pub fn validate(&self, interface: &Interface) -> OrchestratorResult<Vec<ValidationWarning>> {
        let mut warnings = Vec::new();
        for (name, parameter) in &interface.parameters {
            match (self.values.get(name), &parameter.kind) {
                (None, _) if parameter.required => {
                    return Err(OrchestratorError::invalid_data(
                        "PARAM_REQUIRED",
                        format!("Parameter '{name}' is required"),
                    ));
                }
                (None, _) => {}
                (Some(DataValue::File(ids)), ParameterKind::File { multiple, .. }) => {
                    if ids.is_empty() {
                        return Err(OrchestratorError::invalid_data(
                            "NO_FILES",
                            format!("Parameter '{name}' requires at least one file"),
                        ));
                    }
                    if !multiple && ids.len() > 1 {
                        return Err(OrchestratorError::invalid_data(
                            "MULTIPLE_FILES",
                            format!("Parameter '{name}' cannot accept multiple files"),
                        ));
                    }
                }
                (Some(DataValue::Json(_)), ParameterKind::Json { .. }) => {}
                (Some(_), _) => {
                    return Err(OrchestratorError::invalid_data(
                        "MISMATCHED_PARAM_TYPE",
                        format!("Parameter '{name}' received a value of the wrong type"),
                    ));
                }
            }
        }
        for name in self.values.keys() {
            if !interface.parameters.contains_key(name) {
                warnings.push(ValidationWarning::new(
                    "UNKNOWN_PARAM",
                    format!("Value '{name}' does not match any parameter"),
                ));
            }
        }
        Ok(warnings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DataJson {
    #[serde(default = "data_version")]
    version: String,
    #[serde(default)]
    files: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    json: BTreeMap<String, serde_json::Value>,
}

fn data_version() -> String {
    DATA_SCHEMA_VERSION.to_string()
}

impl From<DataJson> for Data {
    fn from(value: DataJson) -> Self {
        let mut data = Data::new();
        for (name, ids) in value.files {
            data.values.insert(name, DataValue::File(ids));
        }
        for (name, json) in value.json {
            data.values.insert(name, DataValue::Json(json));
        }
        data
    }
}

impl From<Data> for DataJson {
    fn from(value: Data) -> Self {
        let mut files = BTreeMap::new();
        let mut json = BTreeMap::new();
        for (name, value) in value.values {
            match value {
                DataValue::File(ids) => {
                    files.insert(name, ids);
                }
                DataValue::Json(v) => {
                    json.insert(name, v);
                }
            }
        }
        DataJson {
            version: data_version(),
            files,
            json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interface_json_defaults() {
        let interface: Interface = serde_json::from_value(json!({
            "files": [{"name": "INPUT_IMAGE"}],
            "json": [{"name": "THRESHOLD", "type": "number", "required": false}]
        }))
        .unwrap();

        let image = interface.get("INPUT_IMAGE").unwrap();
        assert!(image.required);
        assert_eq!(
            image.kind,
            ParameterKind::File {
                multiple: false,
                media_types: vec![]
            }
        );
        assert!(!interface.get("THRESHOLD").unwrap().required);
        assert!(interface.validate().is_ok());
    }

    #[test]
    fn test_validate_connection() {
        let recipe_inputs = Interface::new()
            .with_parameter(Parameter::file("INPUT", true, false))
            .with_parameter(Parameter::json("FLAG", "boolean", false));

        let dataset_params = Interface::new().with_parameter(Parameter::file("INPUT", true, false));
        assert!(recipe_inputs.validate_connection(&dataset_params).is_ok());

        let multiple_files = Interface::new().with_parameter(Parameter::file("INPUT", true, true));
        assert!(recipe_inputs.validate_connection(&multiple_files).is_err());

        let missing = Interface::new().with_parameter(Parameter::json("FLAG", "boolean", true));
        assert!(recipe_inputs.validate_connection(&missing).is_err());
    }

    #[test]
    fn test_data_validation() {
        let interface = Interface::new()
            .with_parameter(Parameter::file("INPUT", true, false))
            .with_parameter(Parameter::json("COUNT", "integer", false));

        let data = Data::new().with_files("INPUT", vec![12]);
        assert!(data.validate(&interface).unwrap().is_empty());

        let too_many = Data::new().with_files("INPUT", vec![1, 2]);
        assert!(too_many.validate(&interface).is_err());

        let wrong_kind = Data::new().with_json("INPUT", json!(1));
        assert!(wrong_kind.validate(&interface).is_err());

        assert!(Data::new().validate(&interface).is_err());
    }

    #[test]
    fn test_data_json_and_file_ids() {
        let data: Data = serde_json::from_value(json!({
            "files": {"A": [5, 3], "B": [3]},
            "json": {"C": "x"}
        }))
        .unwrap();
        assert_eq!(data.file_ids(), vec![3, 5]);

        let encoded = serde_json::to_value(&data).unwrap();
        assert_eq!(encoded["version"], "7");
        assert_eq!(encoded["json"]["C"], "x");

        let mut target = Data::new();
        target.add_value_from_output_data("IN", "A", &data).unwrap();
        assert_eq!(target.values["IN"], DataValue::File(vec![5, 3]));
        assert!(target.add_value_from_output_data("IN2", "MISSING", &data).is_err());
    }
}
