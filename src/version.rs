//! OpenFOAM 版本画像
//!
//! 静态注册表，按 (distribution, version) 查找；画像提供物理类型到求解器的映射与
//! 注入各阶段 system prompt 的版本上下文（prompt_context）。

/// 单个版本画像：求解器映射、湍流模型与版本差异说明
#[derive(Debug)]
pub struct VersionProfile {
    pub distribution: &'static str,
    pub version: &'static str,
    pub docker_image: &'static str,
    /// 物理类型键 -> 求解器可执行名
    pub solvers: &'static [(&'static str, &'static str)],
    pub turbulence_models: &'static [&'static str],
    /// 该版本区别于其它版本的注意事项（原样进入提示词）
    pub quirks: &'static [&'static str],
}

impl VersionProfile {
    /// 根据物理类型键查求解器
    pub fn solver_for(&self, physics_key: &str) -> Option<&'static str> {
        self.solvers
            .iter()
            .find(|(key, _)| *key == physics_key)
            .map(|(_, solver)| *solver)
    }

    /// 渲染为提示词中的版本上下文段落
    pub fn prompt_context(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "## OpenFOAM environment\nDistribution: {} | Version: {} | Docker image: {}\n\n",
            self.distribution, self.version, self.docker_image
        ));
        out.push_str("Solver selection by physics type:\n");
        for (key, solver) in self.solvers {
            out.push_str(&format!("- {key}: {solver}\n"));
        }
        out.push_str("\nAvailable turbulence models: ");
        out.push_str(&self.turbulence_models.join(", "));
        out.push('\n');
        if !self.quirks.is_empty() {
            out.push_str("\nVersion-specific notes:\n");
            for q in self.quirks {
                out.push_str(&format!("- {q}\n"));
            }
        }
        out
    }
}

static FOUNDATION_V11: VersionProfile = VersionProfile {
    distribution: "foundation",
    version: "11",
    docker_image: "openfoam/openfoam11-paraview510",
    solvers: &[
        ("incompressible_steady_laminar", "simpleFoam"),
        ("incompressible_steady_turbulent", "simpleFoam"),
        ("incompressible_transient_laminar", "icoFoam"),
        ("incompressible_transient_turbulent", "pimpleFoam"),
        ("compressible_steady", "rhoSimpleFoam"),
        ("compressible_transient", "rhoPimpleFoam"),
        ("multiphase_vof", "interFoam"),
        ("heat_transfer_buoyant_steady", "buoyantSimpleFoam"),
        ("heat_transfer_buoyant_transient", "buoyantPimpleFoam"),
    ],
    turbulence_models: &["kEpsilon", "kOmegaSST", "SpalartAllmaras", "realizableKE"],
    quirks: &[
        "Tutorials live under $FOAM_TUTORIALS organised by solver name",
        "fvSolution uses the residualControl dict for steady convergence criteria",
        "Use blockMesh then checkMesh before any solver run",
    ],
};

static FOUNDATION_V13: VersionProfile = VersionProfile {
    distribution: "foundation",
    version: "13",
    docker_image: "openfoam/openfoam13-paraview512",
    solvers: &[
        ("incompressible_steady_laminar", "foamRun -solver incompressibleFluid"),
        ("incompressible_steady_turbulent", "foamRun -solver incompressibleFluid"),
        ("incompressible_transient_laminar", "foamRun -solver incompressibleFluid"),
        ("incompressible_transient_turbulent", "foamRun -solver incompressibleFluid"),
        ("compressible_steady", "foamRun -solver fluid"),
        ("compressible_transient", "foamRun -solver fluid"),
        ("multiphase_vof", "foamRun -solver incompressibleVoF"),
        ("heat_transfer_buoyant_steady", "foamRun -solver fluid"),
        ("heat_transfer_buoyant_transient", "foamRun -solver fluid"),
    ],
    turbulence_models: &["kEpsilon", "kOmegaSST", "SpalartAllmaras", "realizableKE"],
    quirks: &[
        "Solvers are modules of foamRun; legacy solver binaries like simpleFoam are gone",
        "Tutorials are organised by module under $FOAM_TUTORIALS",
        "momentumTransport replaces turbulenceProperties from older versions",
    ],
};

/// 按 (distribution, version) 查找画像；未知组合返回 None（启动时报配置错误）
pub fn lookup(distribution: &str, version: &str) -> Option<&'static VersionProfile> {
    match (distribution, version) {
        ("foundation", "11") => Some(&FOUNDATION_V11),
        ("foundation", "13") => Some(&FOUNDATION_V13),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_profiles() {
        assert!(lookup("foundation", "11").is_some());
        assert!(lookup("foundation", "13").is_some());
        assert!(lookup("foundation", "99").is_none());
        assert!(lookup("esi", "2312").is_none());
    }

    #[test]
    fn solver_mapping_v11() {
        let p = lookup("foundation", "11").unwrap();
        assert_eq!(p.solver_for("incompressible_steady_turbulent"), Some("simpleFoam"));
        assert_eq!(p.solver_for("incompressible_transient_turbulent"), Some("pimpleFoam"));
        assert_eq!(p.solver_for("multiphase_vof"), Some("interFoam"));
        assert_eq!(p.solver_for("no_such_physics"), None);
    }

    #[test]
    fn prompt_context_mentions_version() {
        let p = lookup("foundation", "13").unwrap();
        let ctx = p.prompt_context();
        assert!(ctx.contains("Version: 13"));
        assert!(ctx.contains("foamRun"));
    }
}
