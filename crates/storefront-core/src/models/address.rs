use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zipcode: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub is_default: bool,
}

impl Address {
    /// Single-line rendering used in listings
    pub fn one_line(&self) -> String {
        [
            self.fullname.as_str(),
            self.street.as_str(),
            self.city.as_str(),
            self.state.as_str(),
            self.zipcode.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressForm {
    pub fullname: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub zipcode: String,
    pub country: String,
    pub phone: String,
    pub is_default: bool,
}

impl Default for AddressForm {
    fn default() -> Self {
        Self {
            fullname: String::new(),
            street: String::new(),
            city: String::new(),
            state: String::new(),
            zipcode: String::new(),
            country: "India".to_string(),
            phone: String::new(),
            is_default: false,
        }
    }
}
