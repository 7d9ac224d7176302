//! Feature factories
//!
//! A factory owns the domain of one query parameter and knows how to draw a
//! random value from it, enumerate its values, mutate a value and recombine
//! two values. Every value a factory returns stays inside its domain: weights
//! within range, set sizes within `[min_set_size, max_set_size]`.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ConfigError;
use crate::feature::{
    snap_number, MinShouldMatch, Operator, QueryOperator, StringList, WeightedField,
    WeightedFields,
};

/// Generator bound to a named parameter and its domain.
pub trait FeatureFactory {
    type Value: Clone;

    fn name(&self) -> &str;

    /// One value drawn from the domain.
    fn random<R: Rng>(&self, rng: &mut R) -> Self::Value;

    /// Distinct values in a fixed order, stopping once `max_size` are found.
    fn permute(&self, max_size: usize) -> Vec<Self::Value>;

    /// With chance `probability`, a perturbed copy scaled by `amplitude`;
    /// otherwise a plain copy.
    fn mutate<R: Rng>(
        &self,
        value: &Self::Value,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> Self::Value;

    /// Two children built from the parents' material.
    fn crossover<R: Rng>(
        &self,
        a: &Self::Value,
        b: &Self::Value,
        rng: &mut R,
    ) -> (Self::Value, Self::Value);
}

// =============================================================================
// Shared operator helpers
// =============================================================================

/// Bounded random walk: step up to `amplitude * (max - min)` either way, then clip.
pub fn mutate_scalar<R: Rng>(value: f64, min: f64, max: f64, amplitude: f64, rng: &mut R) -> f64 {
    let range = max - min;
    if range <= 0.0 {
        return min;
    }
    let delta = rng.gen_range(-1.0..=1.0) * amplitude * range;
    (value + delta).clamp(min, max)
}

/// Each child independently takes A's or B's value.
pub(crate) fn pick_pair<T: Clone, R: Rng>(a: &T, b: &T, rng: &mut R) -> (T, T) {
    let first = if rng.gen::<bool>() { a.clone() } else { b.clone() };
    let second = if rng.gen::<bool>() { a.clone() } else { b.clone() };
    (first, second)
}

/// Index drawn in proportion to `weights`. Zero total falls back to uniform.
pub(crate) fn weighted_choice<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= 0.0 {
        return rng.gen_range(0..weights.len());
    }
    let mut r = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if *w <= 0.0 {
            continue;
        }
        if r < *w {
            return i;
        }
        r -= w;
    }
    weights.iter().rposition(|w| *w > 0.0).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetEdit {
    Insert,
    Remove,
    Modify,
}

/// Swap an insert for a remove (and back) when the requested edit would
/// break the set-size bounds or has nothing to work on.
pub(crate) fn resolve_set_edit(
    wanted: SetEdit,
    size: usize,
    min: usize,
    max: usize,
    can_insert: bool,
    can_remove: bool,
    can_modify: bool,
) -> Option<SetEdit> {
    let insert_ok = can_insert && size < max;
    let remove_ok = can_remove && size > min;
    let order = match wanted {
        SetEdit::Insert => [SetEdit::Insert, SetEdit::Remove, SetEdit::Modify],
        SetEdit::Remove => [SetEdit::Remove, SetEdit::Insert, SetEdit::Modify],
        SetEdit::Modify if size < min => [SetEdit::Insert, SetEdit::Modify, SetEdit::Remove],
        SetEdit::Modify => [SetEdit::Modify, SetEdit::Insert, SetEdit::Remove],
    };
    order.into_iter().find(|edit| match edit {
        SetEdit::Insert => insert_ok,
        SetEdit::Remove => remove_ok,
        SetEdit::Modify => can_modify,
    })
}

/// Set crossover keyed by identifier.
///
/// Each child receives every pinned key plus a random-sized subset of the
/// shuffled union of both parents' keys. Keys held by both parents get a
/// value from `merge`; keys held by one parent pass through.
pub(crate) fn crossover_keyed<V, R, F>(
    a: &[(String, V)],
    b: &[(String, V)],
    is_pinned: &dyn Fn(&str) -> bool,
    min_set_size: usize,
    max_set_size: usize,
    rng: &mut R,
    mut merge: F,
) -> (Vec<(String, V)>, Vec<(String, V)>)
where
    V: Clone,
    R: Rng,
    F: FnMut(&V, &V, &mut R) -> (V, V),
{
    let mut union: Vec<String> = a.iter().map(|(k, _)| k.clone()).collect();
    for (k, _) in b {
        if !union.contains(k) {
            union.push(k.clone());
        }
    }

    let from_b: HashMap<&str, &V> = b.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let mut shared: HashMap<String, (V, V)> = HashMap::new();
    let mut single: HashMap<String, V> = HashMap::new();
    for (k, va) in a {
        match from_b.get(k.as_str()) {
            Some(vb) => {
                shared.insert(k.clone(), merge(va, *vb, rng));
            }
            None => {
                single.insert(k.clone(), va.clone());
            }
        }
    }
    for (k, vb) in b {
        if !shared.contains_key(k) {
            single.insert(k.clone(), vb.clone());
        }
    }

    let pinned: Vec<String> = union.iter().filter(|k| is_pinned(k.as_str())).cloned().collect();
    let free: Vec<String> = union.iter().filter(|k| !is_pinned(k.as_str())).cloned().collect();

    let pick_child = |second: bool, rng: &mut R| -> Vec<(String, V)> {
        let mut pool = free.clone();
        pool.shuffle(rng);
        let lo = min_set_size.max(pinned.len()).min(union.len());
        let hi = max_set_size.min(union.len()).max(lo);
        let size = rng.gen_range(lo..=hi);
        let keys = pinned
            .iter()
            .chain(pool.iter())
            .take(size)
            .cloned()
            .collect::<Vec<_>>();
        keys.into_iter()
            .filter_map(|k| {
                let v = match shared.get(&k) {
                    Some((x, y)) => Some(if second { y.clone() } else { x.clone() }),
                    None => single.get(&k).cloned(),
                };
                v.map(|v| (k, v))
            })
            .collect()
    };

    let first = pick_child(false, rng);
    let second = pick_child(true, rng);
    (first, second)
}

pub(crate) fn check_set_sizes(
    name: &str,
    min_set_size: usize,
    max_set_size: usize,
    domain: usize,
) -> Result<(), ConfigError> {
    if max_set_size == 0 {
        return Err(ConfigError::SetSize {
            name: name.to_string(),
            reason: "max set size must be at least 1".to_string(),
        });
    }
    if min_set_size > max_set_size {
        return Err(ConfigError::SetSize {
            name: name.to_string(),
            reason: format!("min set size {} exceeds max {}", min_set_size, max_set_size),
        });
    }
    if min_set_size > domain {
        return Err(ConfigError::SetSize {
            name: name.to_string(),
            reason: format!("min set size {} exceeds the {} available values", min_set_size, domain),
        });
    }
    Ok(())
}

// =============================================================================
// Weighted field lists
// =============================================================================

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    fixed_weight: Option<f64>,
}

/// Field lists such as `qf` and `pf`.
///
/// Fields declared as `name^w` are pinned: always present at weight `w` and
/// never reweighted. Bare fields take weights from `default_weights`, where a
/// zero weight means the field is left out.
#[derive(Debug, Clone)]
pub struct WeightedFieldsFactory {
    name: String,
    fields: Vec<FieldSpec>,
    default_weights: Vec<f64>,
    min_weight: f64,
    max_weight: f64,
    min_set_size: usize,
    max_set_size: usize,
}

impl WeightedFieldsFactory {
    pub fn new(
        name: &str,
        fields: &[String],
        default_weights: &[f64],
        min_set_size: usize,
        max_set_size: usize,
    ) -> Result<Self, ConfigError> {
        if fields.is_empty() {
            return Err(ConfigError::EmptyDomain {
                name: name.to_string(),
            });
        }
        let mut specs: Vec<FieldSpec> = Vec::with_capacity(fields.len());
        for decl in fields {
            let (field, fixed_weight) = WeightedField::parse_declaration(decl)?;
            if specs.iter().any(|s| s.name == field) {
                return Err(ConfigError::Parse(format!(
                    "field '{}' declared twice in '{}'",
                    field, name
                )));
            }
            specs.push(FieldSpec {
                name: field,
                fixed_weight,
            });
        }

        let mut weights: Vec<f64> = Vec::new();
        for &w in default_weights {
            if w < 0.0 || !w.is_finite() {
                return Err(ConfigError::Parse(format!("bad default weight {} in '{}'", w, name)));
            }
            if !weights.contains(&w) {
                weights.push(w);
            }
        }
        let positive: Vec<f64> = weights.iter().copied().filter(|w| *w > 0.0).collect();
        let has_free = specs.iter().any(|s| s.fixed_weight.is_none());
        if has_free && positive.is_empty() {
            return Err(ConfigError::EmptyDomain {
                name: name.to_string(),
            });
        }

        let min_set_size = min_set_size.max(1);
        let max_set_size = max_set_size.min(specs.len());
        check_set_sizes(name, min_set_size, max_set_size, specs.len())?;
        let pinned = specs.iter().filter(|s| s.fixed_weight.is_some()).count();
        if pinned > max_set_size {
            return Err(ConfigError::SetSize {
                name: name.to_string(),
                reason: format!("{} pinned fields exceed max set size {}", pinned, max_set_size),
            });
        }

        let min_weight = positive.iter().copied().fold(f64::INFINITY, f64::min);
        let max_weight = positive.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(Self {
            name: name.to_string(),
            fields: specs,
            default_weights: weights,
            min_weight: if min_weight.is_finite() { min_weight } else { 0.0 },
            max_weight: if max_weight.is_finite() { max_weight } else { 0.0 },
            min_set_size,
            max_set_size,
        })
    }

    pub fn is_pinned(&self, field: &str) -> bool {
        self.fields
            .iter()
            .any(|s| s.name == field && s.fixed_weight.is_some())
    }

    fn position(&self, field: &str) -> usize {
        self.fields
            .iter()
            .position(|s| s.name == field)
            .unwrap_or(usize::MAX)
    }

    fn sorted(&self, mut fields: Vec<WeightedField>) -> WeightedFields {
        fields.sort_by_key(|f| self.position(&f.field));
        WeightedFields::new(fields)
    }

    fn random_weight<R: Rng>(&self, rng: &mut R) -> f64 {
        let positive: Vec<f64> = self
            .default_weights
            .iter()
            .copied()
            .filter(|w| *w > 0.0)
            .collect();
        positive.choose(rng).copied().unwrap_or(self.max_weight)
    }

    fn permute_from(
        &self,
        i: usize,
        current: &mut Vec<WeightedField>,
        out: &mut Vec<WeightedFields>,
        max_size: usize,
    ) {
        if out.len() >= max_size || current.len() > self.max_set_size {
            return;
        }
        if current.len() + (self.fields.len() - i) < self.min_set_size {
            return;
        }
        if i == self.fields.len() {
            if !current.is_empty() {
                out.push(WeightedFields::new(current.clone()));
            }
            return;
        }
        let decl = &self.fields[i];
        match decl.fixed_weight {
            Some(w) => {
                current.push(WeightedField::new(decl.name.clone(), w));
                self.permute_from(i + 1, current, out, max_size);
                current.pop();
            }
            None => {
                for &w in &self.default_weights {
                    if w > 0.0 {
                        current.push(WeightedField::new(decl.name.clone(), w));
                        self.permute_from(i + 1, current, out, max_size);
                        current.pop();
                    } else {
                        self.permute_from(i + 1, current, out, max_size);
                    }
                }
            }
        }
    }
}

impl FeatureFactory for WeightedFieldsFactory {
    type Value = WeightedFields;

    fn name(&self) -> &str {
        &self.name
    }

    fn random<R: Rng>(&self, rng: &mut R) -> WeightedFields {
        let mut chosen: Vec<WeightedField> = self
            .fields
            .iter()
            .filter_map(|s| s.fixed_weight.map(|w| WeightedField::new(s.name.clone(), w)))
            .collect();
        let mut free: Vec<&FieldSpec> = self
            .fields
            .iter()
            .filter(|s| s.fixed_weight.is_none())
            .collect();
        free.shuffle(rng);

        let lo = self.min_set_size.max(chosen.len()).max(1);
        let hi = self.max_set_size.max(lo);
        let size = rng.gen_range(lo..=hi);
        for decl in free.into_iter().take(size.saturating_sub(chosen.len())) {
            let w = self.random_weight(rng);
            chosen.push(WeightedField::new(decl.name.clone(), w));
        }
        self.sorted(chosen)
    }

    fn permute(&self, max_size: usize) -> Vec<WeightedFields> {
        let mut out = Vec::new();
        let mut current = Vec::new();
        self.permute_from(0, &mut current, &mut out, max_size);
        out
    }

    fn mutate<R: Rng>(
        &self,
        value: &WeightedFields,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> WeightedFields {
        if rng.gen::<f64>() >= probability {
            return value.clone();
        }
        let mut fields = value.fields.clone();
        let absent: Vec<&FieldSpec> = self
            .fields
            .iter()
            .filter(|s| s.fixed_weight.is_none() && value.get(&s.name).is_none())
            .collect();
        let present_free: Vec<usize> = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| !self.is_pinned(&f.field))
            .map(|(i, _)| i)
            .collect();

        let wanted = [SetEdit::Insert, SetEdit::Remove, SetEdit::Modify][rng.gen_range(0..3)];
        let edit = resolve_set_edit(
            wanted,
            fields.len(),
            self.min_set_size,
            self.max_set_size,
            !absent.is_empty(),
            !present_free.is_empty(),
            !present_free.is_empty(),
        );
        match edit {
            Some(SetEdit::Insert) => {
                if let Some(decl) = absent.choose(rng) {
                    let w = self.random_weight(rng);
                    fields.push(WeightedField::new(decl.name.clone(), w));
                }
            }
            Some(SetEdit::Remove) => {
                if let Some(&idx) = present_free.choose(rng) {
                    fields.remove(idx);
                }
            }
            Some(SetEdit::Modify) => {
                if let Some(&idx) = present_free.choose(rng) {
                    let w = mutate_scalar(
                        fields[idx].weight,
                        self.min_weight,
                        self.max_weight,
                        amplitude,
                        rng,
                    );
                    fields[idx].weight =
                        ((w * 100.0).round() / 100.0).clamp(self.min_weight, self.max_weight);
                }
            }
            None => {}
        }
        self.sorted(fields)
    }

    fn crossover<R: Rng>(
        &self,
        a: &WeightedFields,
        b: &WeightedFields,
        rng: &mut R,
    ) -> (WeightedFields, WeightedFields) {
        let to_pairs = |w: &WeightedFields| -> Vec<(String, f64)> {
            w.fields.iter().map(|f| (f.field.clone(), f.weight)).collect()
        };
        let is_pinned = |field: &str| self.is_pinned(field);
        let (x, y) = crossover_keyed(
            &to_pairs(a),
            &to_pairs(b),
            &is_pinned,
            self.min_set_size,
            self.max_set_size,
            rng,
            |wa, wb, rng| pick_pair(wa, wb, rng),
        );
        let build = |pairs: Vec<(String, f64)>| {
            self.sorted(
                pairs
                    .into_iter()
                    .map(|(f, w)| WeightedField::new(f, w))
                    .collect(),
            )
        };
        (build(x), build(y))
    }
}

// =============================================================================
// Scalars
// =============================================================================

/// Float parameter such as `tie`. Random draws are uniform over the range
/// spanned by `values`; permutation lists `values` themselves.
#[derive(Debug, Clone)]
pub struct FloatFactory {
    name: String,
    values: Vec<f64>,
    min: f64,
    max: f64,
}

impl FloatFactory {
    pub fn new(name: &str, values: &[f64]) -> Result<Self, ConfigError> {
        let mut distinct: Vec<f64> = Vec::new();
        for &v in values {
            if !v.is_finite() {
                return Err(ConfigError::Parse(format!("bad value {} in '{}'", v, name)));
            }
            if !distinct.contains(&v) {
                distinct.push(v);
            }
        }
        if distinct.is_empty() {
            return Err(ConfigError::EmptyDomain {
                name: name.to_string(),
            });
        }
        let min = distinct.iter().copied().fold(f64::INFINITY, f64::min);
        let max = distinct.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(Self {
            name: name.to_string(),
            values: distinct,
            min,
            max,
        })
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }
}

impl FeatureFactory for FloatFactory {
    type Value = f64;

    fn name(&self) -> &str {
        &self.name
    }

    fn random<R: Rng>(&self, rng: &mut R) -> f64 {
        if self.max <= self.min {
            return self.min;
        }
        snap_number(rng.gen_range(self.min..=self.max)).clamp(self.min, self.max)
    }

    fn permute(&self, max_size: usize) -> Vec<f64> {
        self.values.iter().copied().take(max_size).collect()
    }

    fn mutate<R: Rng>(&self, value: &f64, probability: f64, amplitude: f64, rng: &mut R) -> f64 {
        if rng.gen::<f64>() >= probability {
            return *value;
        }
        snap_number(mutate_scalar(*value, self.min, self.max, amplitude, rng)).clamp(self.min, self.max)
    }

    fn crossover<R: Rng>(&self, a: &f64, b: &f64, rng: &mut R) -> (f64, f64) {
        pick_pair(a, b, rng)
    }
}

/// Integer parameter such as `ps`, over an inclusive range.
#[derive(Debug, Clone)]
pub struct IntFactory {
    name: String,
    min: i64,
    max: i64,
}

impl IntFactory {
    pub fn new(name: &str, min: i64, max: i64) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::Parse(format!(
                "'{}': min {} exceeds max {}",
                name, min, max
            )));
        }
        Ok(Self {
            name: name.to_string(),
            min,
            max,
        })
    }
}

impl FeatureFactory for IntFactory {
    type Value = i64;

    fn name(&self) -> &str {
        &self.name
    }

    fn random<R: Rng>(&self, rng: &mut R) -> i64 {
        rng.gen_range(self.min..=self.max)
    }

    fn permute(&self, max_size: usize) -> Vec<i64> {
        (self.min..=self.max).take(max_size).collect()
    }

    fn mutate<R: Rng>(&self, value: &i64, probability: f64, amplitude: f64, rng: &mut R) -> i64 {
        if rng.gen::<f64>() >= probability {
            return *value;
        }
        let v = mutate_scalar(*value as f64, self.min as f64, self.max as f64, amplitude, rng);
        (v.round() as i64).clamp(self.min, self.max)
    }

    fn crossover<R: Rng>(&self, a: &i64, b: &i64, rng: &mut R) -> (i64, i64) {
        pick_pair(a, b, rng)
    }
}

/// One string out of a fixed set of choices.
#[derive(Debug, Clone)]
pub struct StringFactory {
    name: String,
    values: Vec<String>,
}

impl StringFactory {
    pub fn new(name: &str, values: &[String]) -> Result<Self, ConfigError> {
        let mut distinct: Vec<String> = Vec::new();
        for v in values {
            if !distinct.contains(v) {
                distinct.push(v.clone());
            }
        }
        if distinct.is_empty() {
            return Err(ConfigError::EmptyDomain {
                name: name.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            values: distinct,
        })
    }
}

impl FeatureFactory for StringFactory {
    type Value = String;

    fn name(&self) -> &str {
        &self.name
    }

    fn random<R: Rng>(&self, rng: &mut R) -> String {
        self.values[rng.gen_range(0..self.values.len())].clone()
    }

    fn permute(&self, max_size: usize) -> Vec<String> {
        self.values.iter().take(max_size).cloned().collect()
    }

    fn mutate<R: Rng>(&self, value: &String, probability: f64, _amplitude: f64, rng: &mut R) -> String {
        if rng.gen::<f64>() >= probability {
            return value.clone();
        }
        let others: Vec<&String> = self.values.iter().filter(|v| *v != value).collect();
        match others.choose(rng) {
            Some(v) => (*v).clone(),
            None => value.clone(),
        }
    }

    fn crossover<R: Rng>(&self, a: &String, b: &String, rng: &mut R) -> (String, String) {
        pick_pair(a, b, rng)
    }
}

/// A subset of a fixed set of strings, e.g. boost queries.
#[derive(Debug, Clone)]
pub struct StringListFactory {
    name: String,
    values: Vec<String>,
    min_set_size: usize,
    max_set_size: usize,
}

impl StringListFactory {
    pub fn new(
        name: &str,
        values: &[String],
        min_set_size: usize,
        max_set_size: usize,
    ) -> Result<Self, ConfigError> {
        let mut distinct: Vec<String> = Vec::new();
        for v in values {
            if !distinct.contains(v) {
                distinct.push(v.clone());
            }
        }
        if distinct.is_empty() {
            return Err(ConfigError::EmptyDomain {
                name: name.to_string(),
            });
        }
        let max_set_size = max_set_size.min(distinct.len());
        check_set_sizes(name, min_set_size, max_set_size, distinct.len())?;
        Ok(Self {
            name: name.to_string(),
            values: distinct,
            min_set_size,
            max_set_size,
        })
    }

    fn sorted(&self, mut values: Vec<String>) -> StringList {
        values.sort_by_key(|v| self.values.iter().position(|x| x == v).unwrap_or(usize::MAX));
        StringList::new(values)
    }

    fn permute_from(&self, i: usize, current: &mut Vec<String>, out: &mut Vec<StringList>, max_size: usize) {
        if out.len() >= max_size || current.len() > self.max_set_size {
            return;
        }
        if current.len() + (self.values.len() - i) < self.min_set_size {
            return;
        }
        if i == self.values.len() {
            out.push(StringList::new(current.clone()));
            return;
        }
        self.permute_from(i + 1, current, out, max_size);
        current.push(self.values[i].clone());
        self.permute_from(i + 1, current, out, max_size);
        current.pop();
    }
}

impl FeatureFactory for StringListFactory {
    type Value = StringList;

    fn name(&self) -> &str {
        &self.name
    }

    fn random<R: Rng>(&self, rng: &mut R) -> StringList {
        let size = rng.gen_range(self.min_set_size..=self.max_set_size);
        let chosen: Vec<String> = self
            .values
            .choose_multiple(rng, size)
            .cloned()
            .collect();
        self.sorted(chosen)
    }

    fn permute(&self, max_size: usize) -> Vec<StringList> {
        let mut out = Vec::new();
        self.permute_from(0, &mut Vec::new(), &mut out, max_size);
        out
    }

    fn mutate<R: Rng>(&self, value: &StringList, probability: f64, _amplitude: f64, rng: &mut R) -> StringList {
        if rng.gen::<f64>() >= probability {
            return value.clone();
        }
        let mut values = value.values.clone();
        let absent: Vec<&String> = self.values.iter().filter(|v| !values.contains(v)).collect();
        let wanted = [SetEdit::Insert, SetEdit::Remove, SetEdit::Modify][rng.gen_range(0..3)];
        let edit = resolve_set_edit(
            wanted,
            values.len(),
            self.min_set_size,
            self.max_set_size,
            !absent.is_empty(),
            !values.is_empty(),
            !values.is_empty() && !absent.is_empty(),
        );
        match edit {
            Some(SetEdit::Insert) => {
                if let Some(v) = absent.choose(rng) {
                    values.push((*v).clone());
                }
            }
            Some(SetEdit::Remove) => {
                let idx = rng.gen_range(0..values.len());
                values.remove(idx);
            }
            Some(SetEdit::Modify) => {
                if let Some(v) = absent.choose(rng) {
                    let idx = rng.gen_range(0..values.len());
                    values[idx] = (*v).clone();
                }
            }
            None => {}
        }
        self.sorted(values)
    }

    fn crossover<R: Rng>(&self, a: &StringList, b: &StringList, rng: &mut R) -> (StringList, StringList) {
        let pairs = |l: &StringList| -> Vec<(String, ())> { l.values.iter().map(|v| (v.clone(), ())).collect() };
        let (x, y) = crossover_keyed(
            &pairs(a),
            &pairs(b),
            &|_: &str| false,
            self.min_set_size,
            self.max_set_size,
            rng,
            |_, _, _| ((), ()),
        );
        let build = |p: Vec<(String, ())>| self.sorted(p.into_iter().map(|(k, _)| k).collect());
        (build(x), build(y))
    }
}

// =============================================================================
// Query operator
// =============================================================================

/// Relative weights of the `random()` branches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorWeights {
    pub and: f64,
    pub or: f64,
    pub no_mm: f64,
    pub int_mm: f64,
    pub float_mm: f64,
}

impl Default for OperatorWeights {
    fn default() -> Self {
        Self {
            and: 0.2,
            or: 0.8,
            no_mm: 1.0,
            int_mm: 2.0,
            float_mm: 2.0,
        }
    }
}

/// `q.op` plus optional `mm`, either an integer count or a percentage.
#[derive(Debug, Clone)]
pub struct QueryOperatorFactory {
    name: String,
    operators: Vec<Operator>,
    int_mm: Option<(i64, i64)>,
    float_mm: Option<(f64, f64)>,
    weights: OperatorWeights,
}

impl QueryOperatorFactory {
    pub fn new(
        name: &str,
        operators: &[Operator],
        int_mm: Option<(i64, i64)>,
        float_mm: Option<(f64, f64)>,
        weights: OperatorWeights,
    ) -> Result<Self, ConfigError> {
        let mut legal: Vec<Operator> = Vec::new();
        for op in operators {
            if *op == Operator::Unspecified {
                return Err(ConfigError::Parse(format!("'{}': operator must be AND or OR", name)));
            }
            if !legal.contains(op) {
                legal.push(*op);
            }
        }
        if legal.is_empty() {
            return Err(ConfigError::EmptyDomain {
                name: name.to_string(),
            });
        }
        if let Some((lo, hi)) = int_mm {
            if lo > hi {
                return Err(ConfigError::Parse(format!("'{}': bad int mm range", name)));
            }
        }
        if let Some((lo, hi)) = float_mm {
            if lo > hi || lo < -1.0 || hi > 1.0 {
                return Err(ConfigError::Parse(format!("'{}': bad float mm range", name)));
            }
        }
        let w = weights;
        if [w.and, w.or, w.no_mm, w.int_mm, w.float_mm].iter().any(|x| *x < 0.0) {
            return Err(ConfigError::Parse(format!("'{}': negative branch weight", name)));
        }
        Ok(Self {
            name: name.to_string(),
            operators: legal,
            int_mm,
            float_mm,
            weights,
        })
    }

    fn allows(&self, op: Operator) -> bool {
        self.operators.contains(&op)
    }

    fn random_or<R: Rng>(&self, rng: &mut R) -> QueryOperator {
        let mut branches: Vec<(f64, u8)> = vec![(self.weights.no_mm, 0)];
        if self.int_mm.is_some() {
            branches.push((self.weights.int_mm, 1));
        }
        if self.float_mm.is_some() {
            branches.push((self.weights.float_mm, 2));
        }
        let weights: Vec<f64> = branches.iter().map(|(w, _)| *w).collect();
        let mm = match branches[weighted_choice(&weights, rng)].1 {
            1 => self
                .int_mm
                .map(|(lo, hi)| MinShouldMatch::Int(rng.gen_range(lo..=hi)))
                .unwrap_or(MinShouldMatch::None),
            2 => self
                .float_mm
                .map(|(lo, hi)| {
                    let p = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
                    MinShouldMatch::Percent((p * 100.0).round() / 100.0)
                })
                .unwrap_or(MinShouldMatch::None),
            _ => MinShouldMatch::None,
        };
        QueryOperator::or(mm)
    }
}

impl FeatureFactory for QueryOperatorFactory {
    type Value = QueryOperator;

    fn name(&self) -> &str {
        &self.name
    }

    fn random<R: Rng>(&self, rng: &mut R) -> QueryOperator {
        let use_and = match (self.allows(Operator::And), self.allows(Operator::Or)) {
            (true, true) => weighted_choice(&[self.weights.and, self.weights.or], rng) == 0,
            (true, false) => true,
            _ => false,
        };
        if use_and {
            QueryOperator::and()
        } else {
            self.random_or(rng)
        }
    }

    fn permute(&self, max_size: usize) -> Vec<QueryOperator> {
        let mut out = Vec::new();
        if self.allows(Operator::And) {
            out.push(QueryOperator::and());
        }
        if self.allows(Operator::Or) {
            out.push(QueryOperator::or(MinShouldMatch::None));
            if let Some((lo, hi)) = self.int_mm {
                for n in lo..=hi {
                    out.push(QueryOperator::or(MinShouldMatch::Int(n)));
                }
            }
            if let Some((lo, hi)) = self.float_mm {
                let steps = ((hi - lo) / 0.1).round() as i64;
                for i in 0..=steps {
                    let p = ((lo + i as f64 * 0.1) * 100.0).round() / 100.0;
                    out.push(QueryOperator::or(MinShouldMatch::Percent(p)));
                }
            }
        }
        out.truncate(max_size);
        out
    }

    fn mutate<R: Rng>(
        &self,
        value: &QueryOperator,
        probability: f64,
        _amplitude: f64,
        rng: &mut R,
    ) -> QueryOperator {
        if rng.gen::<f64>() >= probability {
            return *value;
        }
        self.random(rng)
    }

    fn crossover<R: Rng>(
        &self,
        a: &QueryOperator,
        b: &QueryOperator,
        rng: &mut R,
    ) -> (QueryOperator, QueryOperator) {
        pick_pair(a, b, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn seeded_rng() -> StdRng {
        StdRng::seed_from_u64(12345)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn rendered(values: &[WeightedFields]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    // =========================================================================
    // Weighted Field Tests
    // =========================================================================

    #[test]
    fn test_permute_pinned_fields_always_present() {
        let factory = WeightedFieldsFactory::new(
            "qf",
            &strings(&["a", "b^3.2", "c^1.6", "d"]),
            &[0.0, 1.0, 2.0],
            1,
            4,
        )
        .unwrap();
        let perms = factory.permute(200);
        let distinct = rendered(&perms);
        assert_eq!(distinct.len(), perms.len());
        // a and d each: omitted, 1.0 or 2.0
        assert_eq!(perms.len(), 9);
        for p in &perms {
            assert_eq!(p.get("b").map(|f| f.weight), Some(3.2));
            assert_eq!(p.get("c").map(|f| f.weight), Some(1.6));
        }
    }

    #[test]
    fn test_permute_counts_for_unweighted_fields() {
        let fields = strings(&["a", "b", "c", "d"]);

        let binary = WeightedFieldsFactory::new("qf", &fields, &[0.0, 1.0], 1, 4).unwrap();
        assert_eq!(rendered(&binary.permute(1000)).len(), 15);

        let ternary = WeightedFieldsFactory::new("qf", &fields, &[0.0, 1.0, 2.0], 1, 4).unwrap();
        assert_eq!(rendered(&ternary.permute(1000)).len(), 80);

        let capped = WeightedFieldsFactory::new("qf", &fields, &[0.0, 1.0, 2.0], 1, 2).unwrap();
        assert_eq!(rendered(&capped.permute(1000)).len(), 32);
    }

    #[test]
    fn test_permute_respects_cap_and_is_deterministic() {
        let factory = WeightedFieldsFactory::new(
            "qf",
            &strings(&["a", "b", "c", "d"]),
            &[0.0, 1.0, 2.0],
            1,
            4,
        )
        .unwrap();
        let first = factory.permute(10);
        let second = factory.permute(10);
        assert_eq!(first.len(), 10);
        assert_eq!(first, second);
    }

    #[test]
    fn test_random_weighted_fields_within_bounds() {
        let mut rng = seeded_rng();
        let factory = WeightedFieldsFactory::new(
            "qf",
            &strings(&["a", "b^3.2", "c", "d", "e"]),
            &[0.0, 1.0, 2.0],
            2,
            3,
        )
        .unwrap();
        for _ in 0..200 {
            let v = factory.random(&mut rng);
            assert!(v.len() >= 2 && v.len() <= 3, "size {} out of bounds", v.len());
            assert_eq!(v.get("b").map(|f| f.weight), Some(3.2));
            for f in &v.fields {
                if f.field != "b" {
                    assert!(f.weight == 1.0 || f.weight == 2.0);
                }
            }
        }
    }

    #[test]
    fn test_mutate_weighted_fields_keeps_set_size() {
        let mut rng = seeded_rng();
        let factory = WeightedFieldsFactory::new(
            "qf",
            &strings(&["a", "b^3.2", "c", "d", "e"]),
            &[0.0, 0.5, 2.0],
            2,
            3,
        )
        .unwrap();
        let mut v = factory.random(&mut rng);
        for _ in 0..500 {
            v = factory.mutate(&v, 1.0, 0.5, &mut rng);
            assert!(v.len() >= 2 && v.len() <= 3, "size {} out of bounds", v.len());
            assert_eq!(v.get("b").map(|f| f.weight), Some(3.2));
            for f in v.fields.iter().filter(|f| f.field != "b") {
                assert!(f.weight >= 0.5 && f.weight <= 2.0, "weight {} out of range", f.weight);
            }
        }
    }

    #[test]
    fn test_mutate_with_zero_probability_is_identity() {
        let mut rng = seeded_rng();
        let factory = WeightedFieldsFactory::new("qf", &strings(&["a", "b", "c"]), &[0.0, 1.0, 2.0], 1, 3)
            .unwrap();
        let v = factory.random(&mut rng);
        for amplitude in [0.0, 0.5, 1.0] {
            assert_eq!(factory.mutate(&v, 0.0, amplitude, &mut rng), v);
        }
    }

    #[test]
    fn test_crossover_children_draw_from_parent_union() {
        let mut rng = seeded_rng();
        let factory = WeightedFieldsFactory::new(
            "qf",
            &strings(&["a", "b", "c", "d", "e", "f"]),
            &[0.0, 1.0, 2.0],
            1,
            4,
        )
        .unwrap();
        for _ in 0..200 {
            let a = factory.random(&mut rng);
            let b = factory.random(&mut rng);
            let union: HashSet<&str> = a.names().chain(b.names()).collect();
            let (x, y) = factory.crossover(&a, &b, &mut rng);
            for child in [&x, &y] {
                assert!(child.len() >= 1 && child.len() <= 4);
                for name in child.names() {
                    assert!(union.contains(name), "{} not in either parent", name);
                }
                for f in &child.fields {
                    let from_a = a.get(&f.field).map(|p| p.weight);
                    let from_b = b.get(&f.field).map(|p| p.weight);
                    assert!(from_a == Some(f.weight) || from_b == Some(f.weight));
                }
            }
        }
    }

    #[test]
    fn test_pinned_fields_exceeding_max_rejected() {
        let result = WeightedFieldsFactory::new("qf", &strings(&["a^1", "b^2", "c"]), &[1.0], 1, 1);
        assert!(matches!(result, Err(ConfigError::SetSize { .. })));
    }

    // =========================================================================
    // Scalar Tests
    // =========================================================================

    #[test]
    fn test_float_mutate_zero_probability_unchanged() {
        let mut rng = seeded_rng();
        let factory = FloatFactory::new("tie", &[0.0, 0.1, 0.5]).unwrap();
        for amplitude in [0.0, 0.3, 1.0, 5.0] {
            assert_eq!(factory.mutate(&0.1, 0.0, amplitude, &mut rng), 0.1);
        }
    }

    #[test]
    fn test_float_mutate_stays_in_range() {
        let mut rng = seeded_rng();
        let factory = FloatFactory::new("tie", &[0.0, 0.5]).unwrap();
        let mut v = factory.random(&mut rng);
        for _ in 0..500 {
            v = factory.mutate(&v, 1.0, 1.0, &mut rng);
            assert!((0.0..=0.5).contains(&v));
        }
    }

    #[test]
    fn test_int_factory_bounds() {
        let mut rng = seeded_rng();
        let factory = IntFactory::new("ps", 0, 5).unwrap();
        assert_eq!(factory.permute(100), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(factory.permute(3).len(), 3);
        for _ in 0..200 {
            let v = factory.mutate(&factory.random(&mut rng), 1.0, 0.8, &mut rng);
            assert!((0..=5).contains(&v));
        }
        assert_eq!(factory.mutate(&3, 0.0, 1.0, &mut rng), 3);
    }

    #[test]
    fn test_scalar_crossover_takes_parent_values() {
        let mut rng = seeded_rng();
        let factory = StringFactory::new("type", &strings(&["best_fields", "most_fields"])).unwrap();
        let a = "best_fields".to_string();
        let b = "most_fields".to_string();
        for _ in 0..50 {
            let (x, y) = factory.crossover(&a, &b, &mut rng);
            assert!(x == a || x == b);
            assert!(y == a || y == b);
        }
    }

    #[test]
    fn test_string_mutate_picks_other_value() {
        let mut rng = seeded_rng();
        let factory = StringFactory::new("type", &strings(&["x", "y"])).unwrap();
        assert_eq!(factory.mutate(&"x".to_string(), 1.0, 1.0, &mut rng), "y");
        assert_eq!(factory.mutate(&"x".to_string(), 0.0, 1.0, &mut rng), "x");
    }

    // =========================================================================
    // String List Tests
    // =========================================================================

    #[test]
    fn test_string_list_permute_and_mutate_bounds() {
        let mut rng = seeded_rng();
        let factory = StringListFactory::new("bq", &strings(&["p", "q", "r", "s"]), 1, 2).unwrap();
        // 4 singles + 6 pairs
        assert_eq!(factory.permute(100).len(), 10);

        let mut v = factory.random(&mut rng);
        for _ in 0..300 {
            v = factory.mutate(&v, 1.0, 1.0, &mut rng);
            assert!(!v.values.is_empty() && v.values.len() <= 2);
        }
    }

    #[test]
    fn test_string_list_crossover_subset_of_union() {
        let mut rng = seeded_rng();
        let factory = StringListFactory::new("bq", &strings(&["p", "q", "r", "s"]), 1, 3).unwrap();
        for _ in 0..100 {
            let a = factory.random(&mut rng);
            let b = factory.random(&mut rng);
            let (x, y) = factory.crossover(&a, &b, &mut rng);
            for child in [x, y] {
                for v in &child.values {
                    assert!(a.values.contains(v) || b.values.contains(v));
                }
            }
        }
    }

    // =========================================================================
    // Query Operator Tests
    // =========================================================================

    #[test]
    fn test_query_operator_random_proportions() {
        let mut rng = seeded_rng();
        let factory = QueryOperatorFactory::new(
            "q.op",
            &[Operator::And, Operator::Or],
            Some((-3, 4)),
            Some((-0.8, 0.8)),
            OperatorWeights::default(),
        )
        .unwrap();

        let draws = 10_000;
        let (mut and, mut none, mut int, mut float) = (0, 0, 0, 0);
        for _ in 0..draws {
            let op = factory.random(&mut rng);
            match (op.operator, op.mm) {
                (Operator::Unspecified, _) => panic!("unspecified operator drawn"),
                (Operator::And, _) => and += 1,
                (Operator::Or, MinShouldMatch::None) => none += 1,
                (Operator::Or, MinShouldMatch::Int(n)) => {
                    assert!((-3..=4).contains(&n));
                    int += 1;
                }
                (Operator::Or, MinShouldMatch::Percent(p)) => {
                    assert!((-0.8..=0.8).contains(&p));
                    float += 1;
                }
            }
        }
        let and_frac = and as f64 / draws as f64;
        assert!((and_frac - 0.2).abs() < 0.1, "AND fraction {}", and_frac);

        let or_total = (none + int + float) as f64;
        assert!((none as f64 / or_total - 0.2).abs() < 0.1);
        assert!((int as f64 / or_total - 0.4).abs() < 0.1);
        assert!((float as f64 / or_total - 0.4).abs() < 0.1);
    }

    #[test]
    fn test_query_operator_only_and() {
        let mut rng = seeded_rng();
        let factory = QueryOperatorFactory::new("q.op", &[Operator::And], None, None, OperatorWeights::default())
            .unwrap();
        for _ in 0..20 {
            assert_eq!(factory.random(&mut rng), QueryOperator::and());
        }
        assert_eq!(factory.permute(10), vec![QueryOperator::and()]);
    }

    #[test]
    fn test_query_operator_permute_enumerates_ranges() {
        let factory = QueryOperatorFactory::new(
            "q.op",
            &[Operator::And, Operator::Or],
            Some((1, 3)),
            Some((0.5, 0.7)),
            OperatorWeights::default(),
        )
        .unwrap();
        // AND, OR, three ints, three percentages
        assert_eq!(factory.permute(100).len(), 8);
        assert_eq!(factory.permute(4).len(), 4);
    }

    #[test]
    fn test_resolve_set_edit_inverts_at_bounds() {
        assert_eq!(
            resolve_set_edit(SetEdit::Insert, 3, 1, 3, true, true, true),
            Some(SetEdit::Remove)
        );
        assert_eq!(
            resolve_set_edit(SetEdit::Remove, 1, 1, 3, true, true, true),
            Some(SetEdit::Insert)
        );
        assert_eq!(
            resolve_set_edit(SetEdit::Remove, 1, 1, 1, true, true, false),
            None
        );
    }
}
