//! ORM schema model: models, fields, enums and relations.
//!
//! The schema language follows the Prisma model DSL. [`Schema::parse`]
//! produces a validated [`Schema`]; DDL generation (in the `db` crate) and
//! the ERD synthesizer both work from it.

mod parser;

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    pub models: Vec<Model>,
    pub enums: Vec<EnumDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    /// Table name override from `@@map("..")`.
    pub db_name: Option<String>,
    pub fields: Vec<Field>,
    /// Compound primary key from `@@id([..])`.
    pub compound_id: Vec<String>,
    /// Compound unique constraints from `@@unique([..])`.
    pub unique_sets: Vec<Vec<String>>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    /// Column name override from `@map("..")`.
    pub db_name: Option<String>,
    pub ty: FieldType,
    pub arity: Arity,
    pub is_id: bool,
    pub is_unique: bool,
    pub default: Option<DefaultValue>,
    pub relation: Option<Relation>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Scalar(ScalarType),
    Enum(String),
    Model(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Int,
    BigInt,
    Float,
    Decimal,
    String,
    Boolean,
    DateTime,
    Json,
    Bytes,
}

impl ScalarType {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Int" => Self::Int,
            "BigInt" => Self::BigInt,
            "Float" => Self::Float,
            "Decimal" => Self::Decimal,
            "String" => Self::String,
            "Boolean" => Self::Boolean,
            "DateTime" => Self::DateTime,
            "Json" => Self::Json,
            "Bytes" => Self::Bytes,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Int => "Int",
            Self::BigInt => "BigInt",
            Self::Float => "Float",
            Self::Decimal => "Decimal",
            Self::String => "String",
            Self::Boolean => "Boolean",
            Self::DateTime => "DateTime",
            Self::Json => "Json",
            Self::Bytes => "Bytes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Required,
    Optional,
    List,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    AutoIncrement,
    Now,
    /// Client-side generated ids (`uuid()`, `cuid()`); no database default.
    Generated(String),
    /// A literal, already rendered as SQL.
    Literal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub name: Option<String>,
    pub fields: Vec<String>,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<String>,
    pub line: usize,
}

impl Schema {
    /// Parse and validate schema source.
    pub fn parse(source: &str) -> CoreResult<Self> {
        let mut schema = parser::parse(source)?;
        parser::resolve_enums(&mut schema);
        schema.validate()?;
        Ok(schema)
    }

    /// Look up a model by name, falling back to a case-insensitive match
    /// (`driver` finds `Driver`).
    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .or_else(|| self.models.iter().find(|m| m.name.eq_ignore_ascii_case(name)))
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.iter().find(|e| e.name == name)
    }

    /// Models ordered so that every model comes after the models its
    /// foreign keys reference. Reference cycles keep declaration order.
    pub fn creation_order(&self) -> Vec<&Model> {
        let mut ordered: Vec<&Model> = Vec::with_capacity(self.models.len());
        let mut placed: HashSet<&str> = HashSet::new();
        let mut visiting: HashSet<&str> = HashSet::new();

        fn visit<'a>(
            schema: &'a Schema,
            model: &'a Model,
            placed: &mut HashSet<&'a str>,
            visiting: &mut HashSet<&'a str>,
            ordered: &mut Vec<&'a Model>,
        ) {
            if placed.contains(model.name.as_str()) || !visiting.insert(model.name.as_str()) {
                return;
            }
            for dep in model.referenced_models() {
                if let Some(target) = schema.model(dep) {
                    if target.name != model.name {
                        visit(schema, target, placed, visiting, ordered);
                    }
                }
            }
            visiting.remove(model.name.as_str());
            if placed.insert(model.name.as_str()) {
                ordered.push(model);
            }
        }

        for model in &self.models {
            visit(self, model, &mut placed, &mut visiting, &mut ordered);
        }
        ordered
    }

    /// SHA-256 over the schema with comments and layout stripped, so
    /// cosmetic edits do not count as a new migration.
    pub fn checksum(source: &str) -> String {
        let mut hasher = Sha256::new();
        for line in source.lines() {
            let code = match line.find("//") {
                Some(idx) => &line[..idx],
                None => line,
            };
            let normalized: Vec<&str> = code.split_whitespace().collect();
            if !normalized.is_empty() {
                hasher.update(normalized.join(" ").as_bytes());
                hasher.update(b"\n");
            }
        }
        format!("{:x}", hasher.finalize())
    }

    fn validate(&self) -> CoreResult<()> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for model in &self.models {
            if let Some(first) = seen.insert(model.name.as_str(), model.line) {
                return Err(CoreError::schema(
                    model.line,
                    format!("model '{}' already defined on line {first}", model.name),
                ));
            }
        }
        for def in &self.enums {
            if seen.contains_key(def.name.as_str()) {
                return Err(CoreError::schema(
                    def.line,
                    format!("'{}' is already defined", def.name),
                ));
            }
        }

        for model in &self.models {
            let mut field_names = HashSet::new();
            for field in &model.fields {
                if !field_names.insert(field.name.as_str()) {
                    return Err(CoreError::schema(
                        field.line,
                        format!("field '{}' defined twice in '{}'", field.name, model.name),
                    ));
                }
                if let FieldType::Model(target) = &field.ty {
                    if self.model(target).is_none() {
                        return Err(CoreError::schema(
                            field.line,
                            format!("unknown type '{target}' for field '{}'", field.name),
                        ));
                    }
                }
            }
            for field in &model.fields {
                let Some(relation) = &field.relation else {
                    continue;
                };
                let FieldType::Model(target_name) = &field.ty else {
                    return Err(CoreError::schema(
                        field.line,
                        "@relation is only valid on model-typed fields",
                    ));
                };
                let target = self.model(target_name).ok_or_else(|| {
                    CoreError::schema(field.line, format!("unknown model '{target_name}'"))
                })?;
                if relation.fields.len() != relation.references.len() {
                    return Err(CoreError::schema(
                        field.line,
                        "@relation fields and references must have the same length",
                    ));
                }
                for local in &relation.fields {
                    if model.field(local).is_none() {
                        return Err(CoreError::schema(
                            field.line,
                            format!("unknown field '{local}' in @relation fields"),
                        ));
                    }
                }
                for remote in &relation.references {
                    if target.field(remote).is_none() {
                        return Err(CoreError::schema(
                            field.line,
                            format!("unknown field '{remote}' on '{}'", target.name),
                        ));
                    }
                }
            }
            for column in model.compound_id.iter().chain(model.unique_sets.iter().flatten()) {
                if model.field(column).is_none() {
                    return Err(CoreError::schema(
                        model.line,
                        format!("unknown field '{column}' in block attribute"),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Model {
    pub fn table_name(&self) -> &str {
        self.db_name.as_deref().unwrap_or(&self.name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields stored as columns (everything except relation fields).
    pub fn columns(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_column())
    }

    /// Primary key field names, from `@id` fields or `@@id`.
    pub fn primary_key(&self) -> Vec<&str> {
        if !self.compound_id.is_empty() {
            return self.compound_id.iter().map(String::as_str).collect();
        }
        self.fields
            .iter()
            .filter(|f| f.is_id)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Models referenced through `@relation(fields: ..)` foreign keys.
    pub fn referenced_models(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(|f| match (&f.ty, &f.relation) {
            (FieldType::Model(target), Some(rel)) if !rel.fields.is_empty() => {
                Some(target.as_str())
            }
            _ => None,
        })
    }

    /// Resolve a field name to its column name, accepting column names too.
    pub fn column_for(&self, name: &str) -> Option<&str> {
        self.columns()
            .find(|f| f.name == name || f.db_name.as_deref() == Some(name))
            .map(Field::column_name)
    }
}

impl Field {
    pub fn column_name(&self) -> &str {
        self.db_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_column(&self) -> bool {
        !matches!(self.ty, FieldType::Model(_))
    }

    pub fn is_optional(&self) -> bool {
        self.arity == Arity::Optional
    }

    pub fn type_name(&self) -> &str {
        match &self.ty {
            FieldType::Scalar(s) => s.name(),
            FieldType::Enum(name) | FieldType::Model(name) => name,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
