//! Parameterizable strings
//!
//! A template such as `recip(ms(NOW,date),[1,2,3],[0.5,1.5],[$1])` holds
//! numeric slots. `[1,2,3]` declares a new slot whose domain is that set
//! (and the range it spans); `[$n]` repeats the value of the n-th declared
//! slot. An instance keeps one value per declared slot, not per occurrence.

use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::error::ConfigError;
use crate::factory::{
    check_set_sizes, crossover_keyed, mutate_scalar, pick_pair, resolve_set_edit, FeatureFactory,
    SetEdit,
};
use crate::feature::{format_number, snap_number};

/// Values of a back-referenced slot must agree within this.
pub const REFERENCE_TOLERANCE: f64 = 0.0001;

const NUMBER_CAPTURE: &str = r"\s*(-?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*";

static SLOT_PATTERN: OnceLock<Regex> = OnceLock::new();

fn slot_pattern() -> &'static Regex {
    SLOT_PATTERN.get_or_init(|| {
        Regex::new(r"\[\s*([$-.\d, ]+)\s*\]").expect("slot regex must compile")
    })
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Slot(usize),
}

#[derive(Debug, Clone)]
struct SlotDomain {
    values: Vec<f64>,
    min: f64,
    max: f64,
}

/// One rendered template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamString {
    factory_id: String,
    values: Vec<f64>,
    rendered: String,
}

impl ParamString {
    pub fn factory_id(&self) -> &str {
        &self.factory_id
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for ParamString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rendered)
    }
}

/// Several templates, at most one instance of each.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamStringList {
    pub entries: Vec<ParamString>,
}

impl ParamStringList {
    pub fn new(entries: Vec<ParamString>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ParamStringFactory {
    id: String,
    template: String,
    segments: Vec<Segment>,
    slots: Vec<SlotDomain>,
    reverse: Regex,
}

impl ParamStringFactory {
    pub fn new(id: &str, template: &str) -> Result<Self, ConfigError> {
        let bad = |reason: String| ConfigError::Template {
            template: template.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut slots: Vec<SlotDomain> = Vec::new();
        let mut last = 0;
        for caps in slot_pattern().captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                segments.push(Segment::Literal(template[last..whole.start()].to_string()));
            }
            let body = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            if let Some(index) = body.strip_prefix('$') {
                let index: usize = index
                    .trim()
                    .parse()
                    .map_err(|_| bad(format!("bad slot reference '[{}]'", body)))?;
                if index == 0 || index > slots.len() {
                    return Err(ConfigError::UndeclaredReference {
                        template: template.to_string(),
                        index,
                        declared: slots.len(),
                    });
                }
                segments.push(Segment::Slot(index - 1));
            } else {
                let mut values = Vec::new();
                for part in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let v: f64 = part
                        .parse()
                        .map_err(|_| bad(format!("bad number '{}'", part)))?;
                    if !values.contains(&v) {
                        values.push(v);
                    }
                }
                if values.is_empty() {
                    return Err(bad(format!("empty slot '[{}]'", body)));
                }
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                slots.push(SlotDomain { values, min, max });
                segments.push(Segment::Slot(slots.len() - 1));
            }
            last = whole.end();
        }
        if last < template.len() {
            segments.push(Segment::Literal(template[last..].to_string()));
        }

        let mut pattern = String::from("^");
        for seg in &segments {
            match seg {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Slot(_) => pattern.push_str(NUMBER_CAPTURE),
            }
        }
        pattern.push('$');
        let reverse = Regex::new(&pattern).map_err(|e| bad(e.to_string()))?;

        Ok(Self {
            id: id.to_string(),
            template: template.to_string(),
            segments,
            slots,
            reverse,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Number of declared (unique) slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn render(&self, values: &[f64]) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(i) => out.push_str(&format_number(values.get(*i).copied().unwrap_or(0.0))),
            }
        }
        out
    }

    /// Build an instance from explicit slot values.
    pub fn instance(&self, values: Vec<f64>) -> Result<ParamString, ConfigError> {
        if values.len() != self.slots.len() {
            return Err(ConfigError::Template {
                template: self.template.clone(),
                reason: format!("expected {} values, got {}", self.slots.len(), values.len()),
            });
        }
        for (v, slot) in values.iter().zip(&self.slots) {
            if *v < slot.min - REFERENCE_TOLERANCE || *v > slot.max + REFERENCE_TOLERANCE {
                return Err(ConfigError::Template {
                    template: self.template.clone(),
                    reason: format!("value {} outside [{}, {}]", v, slot.min, slot.max),
                });
            }
        }
        Ok(self.build(values))
    }

    /// Recover slot values from a rendered (possibly hand-written) string.
    pub fn parse_instance(&self, rendered: &str) -> Result<ParamString, ConfigError> {
        let bad = |reason: String| ConfigError::Template {
            template: self.template.clone(),
            reason,
        };
        let caps = self
            .reverse
            .captures(rendered.trim())
            .ok_or_else(|| bad(format!("'{}' does not match the template", rendered)))?;

        let mut values: Vec<Option<f64>> = vec![None; self.slots.len()];
        let mut group = 1;
        for seg in &self.segments {
            let Segment::Slot(idx) = seg else { continue };
            let raw = caps.get(group).map(|m| m.as_str()).unwrap_or("");
            group += 1;
            let v: f64 = raw
                .parse()
                .map_err(|_| bad(format!("bad number '{}' in '{}'", raw, rendered)))?;
            match values[*idx] {
                None => values[*idx] = Some(v),
                Some(prev) if (prev - v).abs() > REFERENCE_TOLERANCE => {
                    return Err(bad(format!(
                        "slot {} repeated with different values {} and {}",
                        idx + 1,
                        prev,
                        v
                    )));
                }
                Some(_) => {}
            }
        }
        self.instance(values.into_iter().map(|v| v.unwrap_or(0.0)).collect())
    }

    fn build(&self, values: Vec<f64>) -> ParamString {
        ParamString {
            factory_id: self.id.clone(),
            rendered: self.render(&values),
            values,
        }
    }

    fn draw(&self, slot: &SlotDomain, v: f64) -> f64 {
        snap_number(v).clamp(slot.min, slot.max)
    }
}

impl FeatureFactory for ParamStringFactory {
    type Value = ParamString;

    fn name(&self) -> &str {
        &self.id
    }

    fn random<R: Rng>(&self, rng: &mut R) -> ParamString {
        let values = self
            .slots
            .iter()
            .map(|slot| {
                if slot.max > slot.min {
                    self.draw(slot, rng.gen_range(slot.min..=slot.max))
                } else {
                    slot.min
                }
            })
            .collect();
        self.build(values)
    }

    fn permute(&self, max_size: usize) -> Vec<ParamString> {
        let mut out = Vec::new();
        let mut current = Vec::with_capacity(self.slots.len());
        self.permute_from(0, &mut current, &mut out, max_size);
        out
    }

    fn mutate<R: Rng>(
        &self,
        value: &ParamString,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> ParamString {
        if rng.gen::<f64>() >= probability || value.values.len() != self.slots.len() {
            return value.clone();
        }
        let values = value
            .values
            .iter()
            .zip(&self.slots)
            .map(|(v, slot)| self.draw(slot, mutate_scalar(*v, slot.min, slot.max, amplitude, rng)))
            .collect();
        self.build(values)
    }

    fn crossover<R: Rng>(
        &self,
        a: &ParamString,
        b: &ParamString,
        rng: &mut R,
    ) -> (ParamString, ParamString) {
        if a.factory_id != self.id || b.factory_id != self.id || a.values.len() != b.values.len() {
            warn!(
                "Crossover of '{}' with mismatched parents '{}' and '{}', keeping parents",
                self.id, a.factory_id, b.factory_id
            );
            return (a.clone(), b.clone());
        }
        let mut first = Vec::with_capacity(a.values.len());
        let mut second = Vec::with_capacity(a.values.len());
        for (x, y) in a.values.iter().zip(&b.values) {
            let (p, q) = pick_pair(x, y, rng);
            first.push(p);
            second.push(q);
        }
        (self.build(first), self.build(second))
    }
}

impl ParamStringFactory {
    fn permute_from(&self, i: usize, current: &mut Vec<f64>, out: &mut Vec<ParamString>, max_size: usize) {
        if out.len() >= max_size {
            return;
        }
        if i == self.slots.len() {
            out.push(self.build(current.clone()));
            return;
        }
        for &v in &self.slots[i].values {
            current.push(v);
            self.permute_from(i + 1, current, out, max_size);
            current.pop();
        }
    }
}

// =============================================================================
// Lists of templates
// =============================================================================

/// A set of templates (e.g. several `bf` boost functions) of which each
/// experiment carries between `min_set_size` and `max_set_size`.
#[derive(Debug, Clone)]
pub struct ParamStringListFactory {
    name: String,
    factories: Vec<ParamStringFactory>,
    min_set_size: usize,
    max_set_size: usize,
    modify_probability: f64,
}

impl ParamStringListFactory {
    /// Default share of mutate edits that change an existing entry; the rest
    /// split evenly between insert and remove.
    pub const DEFAULT_MODIFY_PROBABILITY: f64 = 0.5;

    pub fn new(
        name: &str,
        factories: Vec<ParamStringFactory>,
        min_set_size: usize,
        max_set_size: usize,
    ) -> Result<Self, ConfigError> {
        if factories.is_empty() {
            return Err(ConfigError::EmptyDomain {
                name: name.to_string(),
            });
        }
        for (i, f) in factories.iter().enumerate() {
            if factories[..i].iter().any(|g| g.id == f.id) {
                return Err(ConfigError::Parse(format!(
                    "duplicate template id '{}' in '{}'",
                    f.id, name
                )));
            }
        }
        let max_set_size = max_set_size.min(factories.len());
        check_set_sizes(name, min_set_size, max_set_size, factories.len())?;
        Ok(Self {
            name: name.to_string(),
            factories,
            min_set_size,
            max_set_size,
            modify_probability: Self::DEFAULT_MODIFY_PROBABILITY,
        })
    }

    pub fn with_modify_probability(mut self, p: f64) -> Self {
        self.modify_probability = p.clamp(0.0, 1.0);
        self
    }

    pub fn factory(&self, id: &str) -> Option<&ParamStringFactory> {
        self.factories.iter().find(|f| f.id == id)
    }

    fn position(&self, id: &str) -> usize {
        self.factories
            .iter()
            .position(|f| f.id == id)
            .unwrap_or(usize::MAX)
    }

    fn sorted(&self, mut entries: Vec<ParamString>) -> ParamStringList {
        entries.sort_by_key(|e| self.position(&e.factory_id));
        ParamStringList::new(entries)
    }

    fn permute_from(
        &self,
        i: usize,
        subs: &[Vec<ParamString>],
        current: &mut Vec<ParamString>,
        out: &mut Vec<ParamStringList>,
        max_size: usize,
    ) {
        if out.len() >= max_size || current.len() > self.max_set_size {
            return;
        }
        if current.len() + (subs.len() - i) < self.min_set_size {
            return;
        }
        if i == subs.len() {
            out.push(ParamStringList::new(current.clone()));
            return;
        }
        self.permute_from(i + 1, subs, current, out, max_size);
        for value in &subs[i] {
            current.push(value.clone());
            self.permute_from(i + 1, subs, current, out, max_size);
            current.pop();
        }
    }
}

impl FeatureFactory for ParamStringListFactory {
    type Value = ParamStringList;

    fn name(&self) -> &str {
        &self.name
    }

    fn random<R: Rng>(&self, rng: &mut R) -> ParamStringList {
        let size = rng.gen_range(self.min_set_size..=self.max_set_size);
        let entries = self
            .factories
            .choose_multiple(rng, size)
            .collect::<Vec<_>>()
            .into_iter()
            .map(|f| f.random(rng))
            .collect();
        self.sorted(entries)
    }

    fn permute(&self, max_size: usize) -> Vec<ParamStringList> {
        let subs: Vec<Vec<ParamString>> = self.factories.iter().map(|f| f.permute(max_size)).collect();
        let mut out = Vec::new();
        self.permute_from(0, &subs, &mut Vec::new(), &mut out, max_size);
        out
    }

    /// Applies `floor(amplitude * templates)` edits, at least one.
    fn mutate<R: Rng>(
        &self,
        value: &ParamStringList,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> ParamStringList {
        if rng.gen::<f64>() >= probability {
            return value.clone();
        }
        let ops = ((amplitude * self.factories.len() as f64).floor() as usize).max(1);
        let mut entries = value.entries.clone();
        for _ in 0..ops {
            let absent: Vec<&ParamStringFactory> = self
                .factories
                .iter()
                .filter(|f| !entries.iter().any(|e| e.factory_id == f.id))
                .collect();
            let wanted = if rng.gen::<f64>() < self.modify_probability {
                SetEdit::Modify
            } else if rng.gen::<bool>() {
                SetEdit::Insert
            } else {
                SetEdit::Remove
            };
            let edit = resolve_set_edit(
                wanted,
                entries.len(),
                self.min_set_size,
                self.max_set_size,
                !absent.is_empty(),
                !entries.is_empty(),
                !entries.is_empty(),
            );
            match edit {
                Some(SetEdit::Insert) => {
                    if let Some(f) = absent.choose(rng) {
                        entries.push(f.random(rng));
                    }
                }
                Some(SetEdit::Remove) => {
                    let idx = rng.gen_range(0..entries.len());
                    entries.remove(idx);
                }
                Some(SetEdit::Modify) => {
                    let idx = rng.gen_range(0..entries.len());
                    if let Some(f) = self.factory(&entries[idx].factory_id) {
                        entries[idx] = f.mutate(&entries[idx], 1.0, amplitude, rng);
                    }
                }
                None => {}
            }
        }
        self.sorted(entries)
    }

    fn crossover<R: Rng>(
        &self,
        a: &ParamStringList,
        b: &ParamStringList,
        rng: &mut R,
    ) -> (ParamStringList, ParamStringList) {
        let keyed = |l: &ParamStringList| -> Vec<(String, ParamString)> {
            l.entries.iter().map(|e| (e.factory_id.clone(), e.clone())).collect()
        };
        let (x, y) = crossover_keyed(
            &keyed(a),
            &keyed(b),
            &|_: &str| false,
            self.min_set_size,
            self.max_set_size,
            rng,
            |pa, pb, rng| match self.factory(&pa.factory_id) {
                Some(f) => f.crossover(pa, pb, rng),
                None => (pa.clone(), pb.clone()),
            },
        );
        let build = |pairs: Vec<(String, ParamString)>| self.sorted(pairs.into_iter().map(|(_, v)| v).collect());
        (build(x), build(y))
    }
}
