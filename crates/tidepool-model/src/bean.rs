use tidepool_proto::{BeanId, PmValue};

use crate::ModelError;

/// A named, typed value slot on a bean.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    name: String,
    value: PmValue,
}

impl Property {
    pub fn new(name: impl Into<String>, value: PmValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &PmValue {
        &self.value
    }

    pub(crate) fn set_value(&mut self, value: PmValue) -> PmValue {
        std::mem::replace(&mut self.value, value)
    }
}

/// One node of the presentation-model graph: an id plus an ordered set of
/// named properties. Insertion order is preserved; attribute names are
/// unique per bean.
#[derive(Debug, Clone, PartialEq)]
pub struct Bean {
    id: BeanId,
    properties: Vec<Property>,
}

impl Bean {
    pub fn new(id: BeanId) -> Self {
        Self {
            id,
            properties: Vec::new(),
        }
    }

    pub fn id(&self) -> BeanId {
        self.id
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn get(&self, attribute: &str) -> Option<&PmValue> {
        self.properties
            .iter()
            .find(|property| property.name() == attribute)
            .map(Property::value)
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.properties
            .iter()
            .any(|property| property.name() == attribute)
    }

    pub(crate) fn add_property(
        &mut self,
        attribute: &str,
        value: PmValue,
    ) -> Result<(), ModelError> {
        if self.has_attribute(attribute) {
            return Err(ModelError::DuplicateAttribute {
                bean_id: self.id,
                attribute: attribute.to_string(),
            });
        }
        self.properties.push(Property::new(attribute, value));
        Ok(())
    }

    /// Replaces the value of an existing attribute, returning the old one.
    pub(crate) fn set(&mut self, attribute: &str, value: PmValue) -> Result<PmValue, ModelError> {
        let property = self
            .properties
            .iter_mut()
            .find(|property| property.name() == attribute)
            .ok_or_else(|| ModelError::UnknownAttribute {
                bean_id: self.id,
                attribute: attribute.to_string(),
            })?;
        Ok(property.set_value(value))
    }

    /// Upsert used when applying remote commands: sets the attribute,
    /// creating the slot when it does not exist yet. Returns the old value
    /// (`Null` for a fresh slot).
    pub(crate) fn set_or_insert(&mut self, attribute: &str, value: PmValue) -> PmValue {
        match self
            .properties
            .iter_mut()
            .find(|property| property.name() == attribute)
        {
            Some(property) => property.set_value(value),
            None => {
                self.properties.push(Property::new(attribute, value));
                PmValue::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_property_order() {
        let mut bean = Bean::new(BeanId(1));
        bean.add_property("b", PmValue::Int(2)).expect("add");
        bean.add_property("a", PmValue::Int(1)).expect("add");
        let names: Vec<&str> = bean.properties().iter().map(Property::name).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn rejects_duplicate_attribute() {
        let mut bean = Bean::new(BeanId(1));
        bean.add_property("x", PmValue::Null).expect("add");
        assert_eq!(
            bean.add_property("x", PmValue::Int(1)),
            Err(ModelError::DuplicateAttribute {
                bean_id: BeanId(1),
                attribute: "x".into(),
            })
        );
    }

    #[test]
    fn set_returns_previous_value() {
        let mut bean = Bean::new(BeanId(2));
        bean.add_property("x", PmValue::Int(1)).expect("add");
        let old = bean.set("x", PmValue::Int(2)).expect("set");
        assert_eq!(old, PmValue::Int(1));
        assert_eq!(bean.get("x"), Some(&PmValue::Int(2)));
        assert!(bean.set("missing", PmValue::Null).is_err());
    }

    #[test]
    fn set_or_insert_creates_missing_slot() {
        let mut bean = Bean::new(BeanId(3));
        assert_eq!(bean.set_or_insert("fresh", PmValue::Int(9)), PmValue::Null);
        assert_eq!(bean.get("fresh"), Some(&PmValue::Int(9)));
    }
}
