use std::{collections::HashMap, sync::Arc};

pub use comms::specs::DType;
use comms::specs::TensorSpec;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ActorErr, Result};

/// Where the values of a `ParameterSet` live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Host,
    Device,
}

/// The static description of one named parameter tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub dtype: DType,
}

impl TensorDesc {
    /// Creates a new full precision `TensorDesc`.
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype: DType::F32,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// The amount of bytes this tensor takes in its storage precision.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }

    /// The wire description of this tensor encoded as `dtype`.
    pub fn to_spec(&self, dtype: DType) -> TensorSpec {
        TensorSpec {
            name: self.name.clone(),
            shape: self.shape.clone(),
            dtype,
        }
    }
}

/// The ordered set of tensors a model is made of.
#[derive(Debug, PartialEq)]
pub struct Schema {
    descs: Vec<TensorDesc>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Creates a new `Schema`.
    ///
    /// # Arguments
    /// * `descs` - The tensor descriptions, in the order they are iterated and pushed.
    ///
    /// # Returns
    /// The shared schema or an error if two tensors share a name.
    pub fn new(descs: Vec<TensorDesc>) -> Result<Arc<Self>> {
        let mut index = HashMap::with_capacity(descs.len());

        for (i, desc) in descs.iter().enumerate() {
            if index.insert(desc.name.clone(), i).is_some() {
                return Err(ActorErr::schema(&desc.name, "duplicated tensor name"));
            }
        }

        Ok(Arc::new(Self { descs, index }))
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn descs(&self) -> &[TensorDesc] {
        &self.descs
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// The total amount of scalar parameters.
    pub fn numel(&self) -> usize {
        self.descs.iter().map(TensorDesc::numel).sum()
    }

    /// The total amount of bytes the model takes in its storage precision.
    pub fn nbytes(&self) -> usize {
        self.descs.iter().map(TensorDesc::nbytes).sum()
    }
}

/// A collection of named tensors following a `Schema`.
///
/// Values are always kept as `f32`, the schema's dtype only sets the
/// storage precision used for accounting and for pushing to rollout engines.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    schema: Arc<Schema>,
    location: Location,
    version: u64,
    tensors: Vec<Box<[f32]>>,
}

impl ParameterSet {
    /// Creates a zero filled `ParameterSet` for `schema`.
    pub fn zeros(schema: &Arc<Schema>, location: Location) -> Self {
        let tensors = schema
            .descs()
            .iter()
            .map(|desc| vec![0.; desc.numel()].into_boxed_slice())
            .collect();

        Self {
            schema: Arc::clone(schema),
            location,
            version: 0,
            tensors,
        }
    }

    /// Creates a `ParameterSet` out of the tensor values in schema order.
    ///
    /// # Arguments
    /// * `schema` - The schema the values should follow.
    /// * `location` - Where the values live.
    /// * `tensors` - One buffer per schema tensor.
    ///
    /// # Returns
    /// The parameter set or a `SchemaMismatch` error on any count or size difference.
    pub fn from_tensors(
        schema: &Arc<Schema>,
        location: Location,
        tensors: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if tensors.len() != schema.len() {
            return Err(ActorErr::schema(
                "<model>",
                format!("got {} tensors, expected {}", tensors.len(), schema.len()),
            ));
        }

        for (desc, values) in schema.descs().iter().zip(&tensors) {
            check_len(desc, values.len())?;
        }

        Ok(Self {
            schema: Arc::clone(schema),
            location,
            version: 0,
            tensors: tensors.into_iter().map(Vec::into_boxed_slice).collect(),
        })
    }

    /// Creates a `ParameterSet` out of named tensor values, in any order.
    ///
    /// Every schema tensor must be present exactly once and no unknown names are accepted.
    pub fn from_named<I>(schema: &Arc<Schema>, location: Location, named: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; schema.len()];

        for (name, values) in named {
            let Some(i) = schema.position(&name) else {
                return Err(ActorErr::schema(name, "unknown tensor"));
            };

            check_len(&schema.descs()[i], values.len())?;
            if slots[i].replace(values).is_some() {
                return Err(ActorErr::schema(name, "tensor given twice"));
            }
        }

        let tensors = slots
            .into_iter()
            .zip(schema.descs())
            .map(|(slot, desc)| slot.ok_or_else(|| ActorErr::schema(&desc.name, "missing tensor")))
            .collect::<Result<Vec<_>>>()?;

        Self::from_tensors(schema, location, tensors)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// The amount of optimizer steps these values went through.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.schema.position(name).map(|i| &*self.tensors[i])
    }

    pub fn tensor(&self, i: usize) -> &[f32] {
        &self.tensors[i]
    }

    pub fn tensor_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.tensors[i]
    }

    /// Iterates over every tensor along with its description.
    pub fn iter(&self) -> impl Iterator<Item = (&TensorDesc, &[f32])> {
        self.schema
            .descs()
            .iter()
            .zip(self.tensors.iter().map(|t| &**t))
    }

    pub fn tensors(&self) -> &[Box<[f32]>] {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut [Box<[f32]>] {
        &mut self.tensors
    }

    /// Overwrites every value with `value`.
    pub fn fill(&mut self, value: f32) {
        self.tensors
            .par_iter_mut()
            .for_each(|tensor| tensor.fill(value));
    }

    /// Copies every tensor of `src` into this set, reusing the buffers.
    ///
    /// The copy is done in parallel and only returns once every tensor was written.
    ///
    /// # Arguments
    /// * `src` - The values to copy, must follow the same schema.
    ///
    /// # Returns
    /// A `SchemaMismatch` error if the schemas differ.
    pub fn copy_from(&mut self, src: &ParameterSet) -> Result<()> {
        if !Arc::ptr_eq(&self.schema, &src.schema) && self.schema != src.schema {
            return Err(ActorErr::schema("<model>", "copying between different schemas"));
        }

        self.tensors
            .par_iter_mut()
            .zip(src.tensors.par_iter())
            .for_each(|(dst, src)| dst.copy_from_slice(src));

        self.version = src.version;
        Ok(())
    }

    /// A copy of these values living at `location`.
    pub fn relocated(&self, location: Location) -> Self {
        Self {
            location,
            ..self.clone()
        }
    }

    /// The name of the first tensor holding a NaN or infinite value, if any.
    pub fn find_non_finite(&self) -> Option<&str> {
        self.iter()
            .find(|(_, values)| values.iter().any(|v| !v.is_finite()))
            .map(|(desc, _)| desc.name.as_str())
    }
}

fn check_len(desc: &TensorDesc, got: usize) -> Result<()> {
    if got != desc.numel() {
        return Err(ActorErr::schema(
            &desc.name,
            format!("got {got} values, expected shape {:?}", desc.shape),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Schema> {
        Schema::new(vec![
            TensorDesc::new("embed", vec![2, 3]),
            TensorDesc::new("bias", vec![3]),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_duplicated_names() {
        let descs = vec![TensorDesc::new("w", vec![1]), TensorDesc::new("w", vec![2])];
        assert!(matches!(
            Schema::new(descs),
            Err(ActorErr::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn from_named_orders_by_schema() {
        let schema = schema();
        let set = ParameterSet::from_named(
            &schema,
            Location::Host,
            [
                ("bias".to_string(), vec![7.; 3]),
                ("embed".to_string(), vec![1.; 6]),
            ],
        )
        .unwrap();

        assert_eq!(set.tensor(0), &[1.; 6]);
        assert_eq!(set.get("bias"), Some(&[7.; 3][..]));
    }

    #[test]
    fn from_named_rejects_missing_and_misshaped() {
        let schema = schema();
        let missing =
            ParameterSet::from_named(&schema, Location::Host, [("embed".to_string(), vec![1.; 6])]);
        assert!(matches!(missing, Err(ActorErr::SchemaMismatch { name, .. }) if name == "bias"));

        let misshaped = ParameterSet::from_named(
            &schema,
            Location::Host,
            [
                ("embed".to_string(), vec![1.; 5]),
                ("bias".to_string(), vec![1.; 3]),
            ],
        );
        assert!(matches!(misshaped, Err(ActorErr::SchemaMismatch { name, .. }) if name == "embed"));
    }

    #[test]
    fn copy_from_is_exact() {
        let schema = schema();
        let mut src = ParameterSet::zeros(&schema, Location::Device);
        src.tensor_mut(0)
            .iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = 0.1 * i as f32);
        src.bump_version();

        let mut dst = ParameterSet::zeros(&schema, Location::Host);
        dst.copy_from(&src).unwrap();

        assert_eq!(dst.tensor(0), src.tensor(0));
        assert_eq!(dst.version(), 1);
        assert_eq!(dst.location(), Location::Host);
    }

    #[test]
    fn finds_non_finite_tensor() {
        let schema = schema();
        let mut set = ParameterSet::zeros(&schema, Location::Host);
        assert_eq!(set.find_non_finite(), None);

        set.tensor_mut(1)[2] = f32::NAN;
        assert_eq!(set.find_non_finite(), Some("bias"));
    }
}
