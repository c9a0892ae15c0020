/// The activation applied element-wise after a dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActFn {
    Relu,
}

impl ActFn {
    pub fn relu() -> Self {
        Self::Relu
    }

    pub fn f(self, z: f32) -> f32 {
        match self {
            Self::Relu => z.max(0.),
        }
    }

    /// Derivative at the pre-activation `z`.
    pub fn df(self, z: f32) -> f32 {
        match self {
            Self::Relu if z > 0. => 1.,
            Self::Relu => 0.,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_gates_negative_inputs() {
        let act = ActFn::relu();
        assert_eq!(act.f(-2.0), 0.0);
        assert_eq!(act.f(3.0), 3.0);
        assert_eq!(act.df(-2.0), 0.0);
        assert_eq!(act.df(3.0), 1.0);
    }
}
