use crate::error::AmesError;
use crate::noun::Noun;

/// `%g`, the vane application pokes are addressed to
const VANE_GALL: u64 = b'g' as u64;
/// `%m`, marks the payload as a typed poke
const POKE_TAG: u64 = b'm' as u64;

/// An application message: a path to the receiving agent, a mark naming the payload's type,
///  and the payload itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Poke {
    pub path: Vec<String>,
    pub mark: String,
    pub data: Noun,
}

impl Poke {
    pub fn new<S: AsRef<str>>(path: &[S], mark: &str, data: Noun) -> Poke {
        Poke {
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
            mark: mark.to_string(),
            data,
        }
    }

    /// `[%g path %0 %m mark data]`
    pub fn to_noun(&self) -> Noun {
        construct_poke(&self.path, &self.mark, self.data.clone())
    }

    pub fn from_noun(noun: &Noun) -> anyhow::Result<Poke> {
        let (path, mark, data) = destruct_poke(noun)?;
        Ok(Poke { path, mark, data })
    }
}

pub fn construct_poke<S: AsRef<str>>(path: &[S], mark: &str, data: Noun) -> Noun {
    Noun::tuple(VANE_GALL.into(), &[
        Noun::path(path),
        0u64.into(),
        POKE_TAG.into(),
        Noun::cord(mark),
        data,
    ])
}

pub fn destruct_poke(noun: &Noun) -> anyhow::Result<(Vec<String>, String, Noun)> {
    let vane = noun.head()?;
    if vane.as_u64()? != VANE_GALL {
        return Err(AmesError::UnexpectedNoun(format!("not a poke, addressed to vane {}", vane)).into());
    }
    let rest = noun.tail()?;
    let path = rest.head()?.as_path()?;

    let rest = rest.tail()?.tail()?;
    let tag = rest.head()?;
    if tag.as_u64()? != POKE_TAG {
        return Err(AmesError::UnexpectedNoun(format!("not a poke, tagged {}", tag)).into());
    }

    let rest = rest.tail()?;
    let mark = rest.head()?.as_cord()?;
    let data = rest.tail()?.clone();
    Ok((path, mark, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noun;

    #[test]
    fn test_construct_poke() {
        let poke = construct_poke(&["ge", "hood"], "helm-hi", Noun::cord("ping"));
        assert_eq!(poke.to_string(), "[103 [25959 1685024616 0] 0 109 29669416873256296 1735289200]");
    }

    #[test]
    fn test_destruct_poke() {
        let poke = Poke::new(&["ge", "hood"], "helm-hi", noun![1u64, 2u64]);
        assert_eq!(Poke::from_noun(&poke.to_noun()).unwrap(), poke);
    }

    #[test]
    fn test_destruct_wrong_vane() {
        let not_a_poke = noun![104u64, 0u64, 0u64, 109u64, 0u64, 0u64];
        let err = destruct_poke(&not_a_poke).unwrap_err();
        assert!(matches!(err.downcast_ref::<AmesError>(), Some(AmesError::UnexpectedNoun(_))));
    }

    #[test]
    fn test_destruct_truncated() {
        assert!(destruct_poke(&noun![103u64, 0u64]).is_err());
    }
}
