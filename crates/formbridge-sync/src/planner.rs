//! Field-by-field merge planning against a destination snapshot.

use formbridge_core::{
    truncate_chars, DestinationRecord, FieldKey, MergePlan, MergePolicy, NormalizedSubmission,
    ProfileLayout, MAX_TEXT_LEN,
};
use formbridge_storage::StatusLabels;

#[derive(Debug, Clone)]
pub struct MergePlanner {
    layout: ProfileLayout,
    status: StatusLabels,
}

impl MergePlanner {
    pub fn new(layout: ProfileLayout, status: StatusLabels) -> Self {
        Self { layout, status }
    }

    /// Incoming values per destination field, before any policy is applied.
    pub fn incoming_values(&self, incoming: &NormalizedSubmission) -> Vec<(FieldKey, String)> {
        let contact = &incoming.contact;
        let optional = [
            (FieldKey::Email, contact.email.clone()),
            (FieldKey::Phone, contact.phone.clone()),
            (FieldKey::Address, contact.street_address.clone()),
            (FieldKey::City, contact.city.clone()),
            (FieldKey::State, contact.state.clone()),
            (FieldKey::SchedulingLink, contact.scheduling_link.clone()),
            (FieldKey::Capabilities, Some(incoming.capabilities.summary())),
            (FieldKey::Relational, incoming.preferences.relational.clone()),
            (FieldKey::Autonomy, incoming.preferences.autonomy.clone()),
        ];
        let mut values: Vec<(FieldKey, String)> = optional
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect();
        values.extend(
            self.layout
                .render(&incoming.profile)
                .into_iter()
                .map(|(property, text)| (FieldKey::Profile(property), text)),
        );
        values.push((
            FieldKey::Status,
            self.status.for_completeness(incoming.completed).to_string(),
        ));
        values
    }

    pub fn plan(&self, current: &DestinationRecord, incoming: &NormalizedSubmission) -> MergePlan {
        let mut plan = MergePlan::default();
        for (key, value) in self.incoming_values(incoming) {
            let value = value.trim();
            let write = match key.policy() {
                MergePolicy::FillIfEmpty => {
                    !value.is_empty() && current.get(&key).trim().is_empty()
                }
                MergePolicy::AlwaysOverwrite => !value.is_empty(),
                MergePolicy::Always => true,
            };
            if !write {
                continue;
            }
            let value = if key.is_long_text() {
                truncate_chars(value, MAX_TEXT_LEN)
            } else {
                value.to_string()
            };
            plan.writes.insert(key, value);
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formbridge_core::{BucketProperty, CapabilityLevel, ContactInfo};

    fn planner() -> MergePlanner {
        MergePlanner::new(
            ProfileLayout {
                buckets: vec![BucketProperty { bucket: "pets".into(), property: "Pets".into() }],
                catch_all_property: "Household Notes".into(),
            },
            StatusLabels { complete: "Complete".into(), partial: "Partial".into() },
        )
    }

    fn jane(contact: ContactInfo) -> NormalizedSubmission {
        NormalizedSubmission::new("Jane", "Smith", contact, "v2-csv").unwrap()
    }

    #[test]
    fn scenario_a_fills_only_the_empty_phone() {
        let incoming = jane(ContactInfo {
            email: Some(String::new()),
            phone: Some("555-1234".into()),
            street_address: Some(String::new()),
            ..ContactInfo::default()
        });
        let current = DestinationRecord::new("p1", "Jane Smith").with_value(FieldKey::Phone, "");
        let plan = planner().plan(&current, &incoming);
        assert_eq!(plan.field_labels(), vec!["phone", "status"]);
        assert_eq!(plan.get(&FieldKey::Phone), Some("555-1234"));
        assert_eq!(plan.get(&FieldKey::Status), Some("Complete"));
    }

    #[test]
    fn scenario_b_capabilities_always_overwrite() {
        let mut incoming = jane(ContactInfo::default());
        incoming.capabilities.insert("Cleaning", CapabilityLevel::L2);
        incoming.capabilities.insert("Cooking", CapabilityLevel::L1);
        let current = DestinationRecord::new("p1", "Jane Smith")
            .with_value(FieldKey::Capabilities, "Cleaning: L1");
        let plan = planner().plan(&current, &incoming);
        assert_eq!(
            plan.get(&FieldKey::Capabilities),
            Some("Cleaning: L2, Cooking: L1")
        );
    }

    #[test]
    fn populated_fields_are_never_overwritten() {
        let mut incoming = jane(ContactInfo {
            phone: Some("555-9999".into()),
            city: Some("Austin".into()),
            ..ContactInfo::default()
        });
        incoming.profile.push("pets", Some("Pets".into()), "Two cats");
        incoming.completed = false;
        let current = DestinationRecord::new("p1", "Jane Smith")
            .with_value(FieldKey::Phone, "555-1234")
            .with_value(FieldKey::City, "Dallas")
            .with_value(FieldKey::Profile("Pets".into()), "Pets: One dog");
        let plan = planner().plan(&current, &incoming);
        assert!(plan.is_status_only());
        assert_eq!(plan.get(&FieldKey::Status), Some("Partial"));
    }

    #[test]
    fn replanning_after_apply_is_stable() {
        let mut incoming = jane(ContactInfo {
            phone: Some("555-1234".into()),
            ..ContactInfo::default()
        });
        incoming.capabilities.insert("Cleaning", CapabilityLevel::L3);
        incoming.preferences.autonomy = Some("Directive".into());
        incoming.profile.push("Favorite color", Some("Favorite color?".into()), "Blue");

        let planner = planner();
        let mut current = DestinationRecord::new("p1", "Jane Smith");
        let first = planner.plan(&current, &incoming);
        assert_eq!(
            first.get(&FieldKey::Profile("Household Notes".into())),
            Some("Favorite color?: Blue")
        );
        first.apply_to(&mut current);

        let second = planner.plan(&current, &incoming);
        assert_eq!(second.field_labels(), vec!["capabilities", "autonomy", "status"]);
        for (key, value) in &second.writes {
            assert_eq!(current.get(key), value);
        }
    }

    #[test]
    fn long_text_is_truncated_silently() {
        let mut incoming = jane(ContactInfo {
            street_address: Some("x".repeat(2500)),
            phone: Some("5".repeat(2500)),
            ..ContactInfo::default()
        });
        incoming.profile.push("pets", None, "y".repeat(3000));
        let plan = planner().plan(&DestinationRecord::new("p1", "Jane Smith"), &incoming);
        assert_eq!(plan.get(&FieldKey::Address).unwrap().chars().count(), MAX_TEXT_LEN);
        assert_eq!(
            plan.get(&FieldKey::Profile("Pets".into())).unwrap().chars().count(),
            MAX_TEXT_LEN
        );
        assert_eq!(plan.get(&FieldKey::Phone).unwrap().len(), 2500);
    }
}
