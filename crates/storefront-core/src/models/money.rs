//! Decimal fields arrive as strings (`"499.00"`) from the backend's decimal
//! serializer, but some endpoints compute totals and send plain numbers.

use serde::{de, Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(f64),
    Text(String),
}

impl RawAmount {
    fn into_f64<E: de::Error>(self) -> Result<f64, E> {
        match self {
            RawAmount::Number(n) => Ok(n),
            RawAmount::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| E::custom(format!("invalid amount: {:?}", s))),
        }
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    RawAmount::deserialize(deserializer)?.into_f64()
}

pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawAmount>::deserialize(deserializer)? {
        Some(raw) => raw.into_f64().map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Priced {
        #[serde(deserialize_with = "super::deserialize")]
        price: f64,
        #[serde(default, deserialize_with = "super::deserialize_opt")]
        discounted: Option<f64>,
    }

    #[test]
    fn test_amount_from_string_or_number() {
        let p: Priced = serde_json::from_str(r#"{"price": "499.50"}"#).unwrap();
        assert_eq!(p.price, 499.5);
        assert_eq!(p.discounted, None);

        let p: Priced = serde_json::from_str(r#"{"price": 12, "discounted": "10.00"}"#).unwrap();
        assert_eq!(p.price, 12.0);
        assert_eq!(p.discounted, Some(10.0));

        let p: Priced = serde_json::from_str(r#"{"price": 1, "discounted": null}"#).unwrap();
        assert_eq!(p.discounted, None);
    }

    #[test]
    fn test_amount_rejects_garbage() {
        assert!(serde_json::from_str::<Priced>(r#"{"price": "free"}"#).is_err());
    }
}
