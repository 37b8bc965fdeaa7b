use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use cb_types::{CancellationToken, SafetyBounds, Setpoint, StrategyError, StrategyResult};

use crate::objective::Objective;
use crate::search::{seeded_rng, GridConfig, SearchCore, SearchStrategy, SetpointSpace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticConfig {
    pub population_size: usize,
    pub generations: usize,
    /// Per-gene mutation probability.
    pub mutation_rate: f64,
    pub crossover_rate: f64,
    pub tournament_size: usize,
    pub seed: Option<u64>,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            population_size: 50,
            generations: 30,
            mutation_rate: 0.1,
            crossover_rate: 0.8,
            tournament_size: 3,
            seed: None,
        }
    }
}

impl GeneticConfig {
    fn validate(&self) -> StrategyResult<()> {
        let fail = |message: String| Err(StrategyError::InvalidConfig { message });
        if self.population_size < 2 {
            return fail(format!("genetic.population_size must be at least 2, got {}", self.population_size));
        }
        if self.tournament_size == 0 || self.tournament_size > self.population_size {
            return fail(format!(
                "genetic.tournament_size must be in [1, {}], got {}",
                self.population_size, self.tournament_size
            ));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) || !(0.0..=1.0).contains(&self.crossover_rate) {
            return fail("genetic rates must be probabilities".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Individual {
    genes: Setpoint,
    fitness: f64,
}

/// Generational genetic search with tournament selection, single-point
/// crossover, per-gene mutation and elitism.
///
/// Each generation is scored in parallel on the rayon pool.
#[derive(Debug, Clone)]
pub struct GeneticSearch {
    config: GeneticConfig,
    space: SetpointSpace,
    rng: ChaCha8Rng,
    core: SearchCore,
}

impl GeneticSearch {
    pub fn new(config: GeneticConfig, bounds: &SafetyBounds, cancel: CancellationToken) -> StrategyResult<Self> {
        config.validate()?;
        let grid = GridConfig::default();
        let space = SetpointSpace::from_bounds(bounds, grid.temperature_step, grid.humidity_step);
        if space.is_empty() {
            return Err(StrategyError::InvalidConfig {
                message: "genetic search space is empty".to_string(),
            });
        }
        Ok(Self {
            rng: seeded_rng(config.seed),
            config,
            space,
            core: SearchCore::new(bounds.default_setpoint, cancel),
        })
    }

    /// Score a batch in parallel, then fold results into the running best on
    /// this thread. Candidates are skipped once cancellation is raised.
    fn evaluate_batch(&mut self, objective: &Objective, genes: Vec<Setpoint>) -> StrategyResult<Vec<Individual>> {
        let cancel = self.core.cancel_token().clone();
        let scored: Vec<Option<Individual>> = genes
            .par_iter()
            .map(|g| {
                (!cancel.is_cancelled()).then(|| Individual {
                    genes: *g,
                    fitness: objective.evaluate(g),
                })
            })
            .collect();

        let mut population = Vec::with_capacity(scored.len());
        for ind in scored.into_iter().flatten() {
            self.core.record(&ind.genes, ind.fitness);
            population.push(ind);
        }
        self.core.check_cancel()?;
        Ok(population)
    }

    fn tournament(&mut self, population: &[Individual]) -> Individual {
        let k = self.config.tournament_size.min(population.len());
        population
            .choose_multiple(&mut self.rng, k)
            .copied()
            .min_by(|a, b| a.fitness.total_cmp(&b.fitness))
            .unwrap_or(population[0])
    }

    /// Single cut point between temperature and humidity: children swap
    /// humidity genes.
    fn crossover(&mut self, a: &Setpoint, b: &Setpoint) -> (Setpoint, Setpoint) {
        if self.rng.gen::<f64>() < self.config.crossover_rate {
            (
                Setpoint::new(a.temperature, b.humidity, a.mode),
                Setpoint::new(b.temperature, a.humidity, b.mode),
            )
        } else {
            (*a, *b)
        }
    }

    fn mutate(&mut self, genes: &mut Setpoint) {
        let rate = self.config.mutation_rate;
        if self.rng.gen::<f64>() < rate {
            genes.temperature = *self.space.temperatures.choose(&mut self.rng).unwrap_or(&genes.temperature);
        }
        if self.rng.gen::<f64>() < rate {
            genes.humidity = *self.space.humidities.choose(&mut self.rng).unwrap_or(&genes.humidity);
        }
        if self.rng.gen::<f64>() < rate {
            genes.mode = *self.space.modes.choose(&mut self.rng).unwrap_or(&genes.mode);
        }
    }
}

impl SearchStrategy for GeneticSearch {
    fn optimize(&mut self, objective: &Objective) -> StrategyResult<Setpoint> {
        self.core.begin();
        info!(
            population_size = self.config.population_size,
            generations = self.config.generations,
            "genetic search started"
        );

        let mut seeds: Vec<Setpoint> = Vec::with_capacity(self.config.population_size);
        if let Some(initial) = self.core.initial() {
            seeds.push(initial);
        }
        while seeds.len() < self.config.population_size {
            seeds.push(self.space.sample(&mut self.rng));
        }
        self.core.check_cancel()?;
        let mut population = self.evaluate_batch(objective, seeds)?;

        for generation in 0..self.config.generations {
            self.core.check_cancel()?;
            let elite = population
                .iter()
                .copied()
                .min_by(|a, b| a.fitness.total_cmp(&b.fitness));

            let mut offspring = Vec::with_capacity(self.config.population_size);
            while offspring.len() < self.config.population_size {
                let p1 = self.tournament(&population);
                let p2 = self.tournament(&population);
                let (mut c1, mut c2) = self.crossover(&p1.genes, &p2.genes);
                self.mutate(&mut c1);
                self.mutate(&mut c2);
                offspring.push(c1);
                if offspring.len() < self.config.population_size {
                    offspring.push(c2);
                }
            }

            let mut next = self.evaluate_batch(objective, offspring)?;
            if let Some(elite) = elite {
                next.push(elite);
            }
            next.sort_by(|a, b| a.fitness.total_cmp(&b.fitness));
            next.truncate(self.config.population_size);
            population = next;

            if (generation + 1) % 5 == 0 {
                let finite: Vec<f64> = population
                    .iter()
                    .map(|i| i.fitness)
                    .filter(|f| f.is_finite())
                    .collect();
                let mean = if finite.is_empty() {
                    f64::INFINITY
                } else {
                    finite.iter().sum::<f64>() / finite.len() as f64
                };
                info!(
                    generation = generation + 1,
                    best = self.core.best_objective(),
                    mean_fitness = mean,
                    "genetic search progress"
                );
            }
        }

        self.core.finish(self.name())
    }

    fn best_params(&self) -> Setpoint {
        self.core.best_params()
    }

    fn best_objective(&self) -> f64 {
        self.core.best_objective()
    }

    fn set_initial_params(&mut self, params: Setpoint) {
        self.core.set_initial(params);
    }

    fn bind_cancel(&mut self, token: CancellationToken) {
        self.core.bind_cancel(token);
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn name(&self) -> &str {
        "genetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tests::objective_with_optimum;

    fn small() -> GeneticConfig {
        GeneticConfig {
            population_size: 20,
            generations: 10,
            seed: Some(5),
            ..GeneticConfig::default()
        }
    }

    #[test]
    fn test_genetic_keeps_elite() {
        let mut ga = GeneticSearch::new(small(), &SafetyBounds::default(), CancellationToken::new()).unwrap();
        // Seeding the optimum means elitism must keep it to the end.
        ga.set_initial_params(Setpoint::new(22.0, 45.0, 1));
        let best = ga.optimize(&objective_with_optimum()).unwrap();
        assert!((ga.best_objective() - (0.7 * 60.0 + 0.3 * 200.0)).abs() < 1e-9);
        assert_eq!(best.temperature, 22.0);
    }

    #[test]
    fn test_crossover_swaps_humidity() {
        let config = GeneticConfig {
            crossover_rate: 1.0,
            ..small()
        };
        let mut ga = GeneticSearch::new(config, &SafetyBounds::default(), CancellationToken::new()).unwrap();
        let (c1, c2) = ga.crossover(&Setpoint::new(20.0, 40.0, 0), &Setpoint::new(26.0, 60.0, 1));
        assert_eq!(c1, Setpoint::new(20.0, 60.0, 0));
        assert_eq!(c2, Setpoint::new(26.0, 40.0, 1));
    }

    #[test]
    fn test_mutation_stays_on_grid() {
        let config = GeneticConfig {
            mutation_rate: 1.0,
            ..small()
        };
        let bounds = SafetyBounds::default();
        let mut ga = GeneticSearch::new(config, &bounds, CancellationToken::new()).unwrap();
        let mut genes = Setpoint::default();
        for _ in 0..100 {
            ga.mutate(&mut genes);
            assert!(bounds.is_admissible(&genes));
        }
    }

    #[test]
    fn test_invalid_tournament() {
        let config = GeneticConfig {
            tournament_size: 100,
            ..small()
        };
        assert!(GeneticSearch::new(config, &SafetyBounds::default(), CancellationToken::new()).is_err());
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        let mut ga = GeneticSearch::new(small(), &SafetyBounds::default(), token.clone()).unwrap();
        ga.stop();
        assert!(matches!(
            ga.optimize(&objective_with_optimum()),
            Err(StrategyError::Pruned { .. })
        ));
        assert!(token.is_cancelled());
    }
}
